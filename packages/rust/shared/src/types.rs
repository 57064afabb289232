//! Core domain types for taxogen taxonomies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use crate::error::{Result, TaxogenError};

// ---------------------------------------------------------------------------
// TaxonomyId / Principal
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for taxonomy identifiers (time-sortable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaxonomyId(pub Uuid);

impl TaxonomyId {
    /// Generate a new time-sortable taxonomy identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TaxonomyId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaxonomyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaxonomyId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// The identity that owns a taxonomy (a username).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Principal(String);

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Principal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Depth
// ---------------------------------------------------------------------------

/// The three fixed levels of a taxonomy tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Depth {
    Category,
    Subcategory,
    SubSubcategory,
}

impl Depth {
    /// The level children of this depth live at, or `None` for leaves.
    pub fn child(self) -> Option<Depth> {
        match self {
            Self::Category => Some(Self::Subcategory),
            Self::Subcategory => Some(Self::SubSubcategory),
            Self::SubSubcategory => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Subcategory => "subcategory",
            Self::SubSubcategory => "sub_subcategory",
        }
    }
}

impl std::fmt::Display for Depth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Depth {
    type Err = TaxogenError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "category" => Ok(Self::Category),
            "subcategory" => Ok(Self::Subcategory),
            "sub_subcategory" | "sub-subcategory" => Ok(Self::SubSubcategory),
            other => Err(TaxogenError::validation(format!("unknown depth '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// CategoryNode / Children
// ---------------------------------------------------------------------------

/// Expansion state of a node's children.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Children {
    /// Nobody asked for children; the engine leaves the node alone.
    #[default]
    Unrequested,
    /// Children were asked for and not fetched yet.
    Requested,
    /// Children are present. Never empty.
    Populated(Vec<CategoryNode>),
}

impl Children {
    /// Map the document marker (absent / `[]` / non-empty list) to a state.
    pub fn from_marker(marker: Option<Vec<CategoryNode>>) -> Self {
        match marker {
            None => Self::Unrequested,
            Some(nodes) if nodes.is_empty() => Self::Requested,
            Some(nodes) => Self::Populated(nodes),
        }
    }

    pub fn is_unrequested(&self) -> bool {
        matches!(self, Self::Unrequested)
    }

    pub fn is_requested(&self) -> bool {
        matches!(self, Self::Requested)
    }

    /// Populated children, or an empty slice.
    pub fn nodes(&self) -> &[CategoryNode] {
        match self {
            Self::Populated(nodes) => nodes,
            _ => &[],
        }
    }
}

/// One node in the three-level category tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryNode {
    pub name: String,
    pub depth: Depth,
    pub children: Children,
}

impl CategoryNode {
    /// A node nobody has asked to expand yet.
    pub fn new(name: impl Into<String>, depth: Depth) -> Self {
        Self {
            name: name.into(),
            depth,
            children: Children::Unrequested,
        }
    }

    /// A freshly classified node: pending children unless it sits at the leaf level.
    pub fn fresh(name: impl Into<String>, depth: Depth) -> Self {
        let children = match depth.child() {
            Some(_) => Children::Requested,
            None => Children::Unrequested,
        };
        Self {
            name: name.into(),
            depth,
            children,
        }
    }

    /// Whether the engine should classify this node in the current round.
    pub fn needs_expansion(&self) -> bool {
        self.depth.child().is_some() && self.children.is_requested()
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// Positional identity of an expandable node within a [`Forest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeId {
    /// Index into the top-level categories.
    Category(usize),
    /// `(category index, subcategory index)`.
    Subcategory(usize, usize),
}

impl NodeId {
    pub fn depth(&self) -> Depth {
        match self {
            Self::Category(_) => Depth::Category,
            Self::Subcategory(..) => Depth::Subcategory,
        }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Category(i) => write!(f, "{i}"),
            Self::Subcategory(i, j) => write!(f, "{i}.{j}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Forest
// ---------------------------------------------------------------------------

/// The ordered list of top-level categories of one taxonomy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Forest {
    categories: Vec<CategoryNode>,
}

impl Forest {
    /// Build a forest from top-level nodes, validating names and depths.
    pub fn new(categories: Vec<CategoryNode>) -> Result<Self> {
        let forest = Self { categories };
        forest.validate()?;
        Ok(forest)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.categories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.categories.len()
    }

    pub fn categories(&self) -> &[CategoryNode] {
        &self.categories
    }

    pub fn categories_mut(&mut self) -> &mut Vec<CategoryNode> {
        &mut self.categories
    }

    pub fn into_categories(self) -> Vec<CategoryNode> {
        self.categories
    }

    pub fn get(&self, id: NodeId) -> Option<&CategoryNode> {
        match id {
            NodeId::Category(i) => self.categories.get(i),
            NodeId::Subcategory(i, j) => self.categories.get(i)?.children.nodes().get(j),
        }
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut CategoryNode> {
        match id {
            NodeId::Category(i) => self.categories.get_mut(i),
            NodeId::Subcategory(i, j) => match &mut self.categories.get_mut(i)?.children {
                Children::Populated(nodes) => nodes.get_mut(j),
                _ => None,
            },
        }
    }

    /// Resolve a name path (`["Mammals"]` or `["Mammals", "Rodentia"]`).
    ///
    /// The first match wins when siblings share a name.
    pub fn find(&self, path: &[&str]) -> Option<NodeId> {
        match path {
            [category] => self
                .categories
                .iter()
                .position(|c| c.name == *category)
                .map(NodeId::Category),
            [category, subcategory] => {
                let i = self.categories.iter().position(|c| c.name == *category)?;
                let j = self.categories[i]
                    .children
                    .nodes()
                    .iter()
                    .position(|s| s.name == *subcategory)?;
                Some(NodeId::Subcategory(i, j))
            }
            _ => None,
        }
    }

    /// Check the three-level shape and that every name is non-blank.
    pub fn validate(&self) -> Result<()> {
        fn check(node: &CategoryNode, expected: Depth) -> Result<()> {
            if node.name.trim().is_empty() {
                return Err(TaxogenError::validation(format!(
                    "{expected} name must not be blank"
                )));
            }
            if node.depth != expected {
                return Err(TaxogenError::validation(format!(
                    "'{}' is tagged {} but sits at {expected} level",
                    node.name, node.depth
                )));
            }
            match (expected.child(), &node.children) {
                (None, Children::Unrequested) => Ok(()),
                (None, _) => Err(TaxogenError::validation(format!(
                    "{expected} '{}' cannot have children",
                    node.name
                ))),
                (Some(_), Children::Populated(nodes)) if nodes.is_empty() => {
                    Err(TaxogenError::validation(format!(
                        "'{}' is marked populated with no children",
                        node.name
                    )))
                }
                (Some(child), children) => children
                    .nodes()
                    .iter()
                    .try_for_each(|c| check(c, child)),
            }
        }

        self.categories
            .iter()
            .try_for_each(|c| check(c, Depth::Category))
    }
}

// Wire format: the nested document shape with depth-specific child keys.
// An absent key is `Unrequested`, `[]` is `Requested`.

#[derive(Serialize)]
struct CategoryOut<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subcategories: Option<Vec<SubcategoryOut<'a>>>,
}

#[derive(Serialize)]
struct SubcategoryOut<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sub_subcategories: Option<Vec<LeafOut<'a>>>,
}

#[derive(Serialize)]
struct LeafOut<'a> {
    name: &'a str,
}

#[derive(Deserialize)]
struct CategoryIn {
    name: String,
    #[serde(default)]
    subcategories: Option<Vec<SubcategoryIn>>,
}

#[derive(Deserialize)]
struct SubcategoryIn {
    name: String,
    #[serde(default)]
    sub_subcategories: Option<Vec<LeafIn>>,
}

#[derive(Deserialize)]
struct LeafIn {
    name: String,
}

fn marker<'a, U>(children: &'a Children, f: impl Fn(&'a CategoryNode) -> U) -> Option<Vec<U>> {
    match children {
        Children::Unrequested => None,
        Children::Requested => Some(Vec::new()),
        Children::Populated(nodes) => Some(nodes.iter().map(f).collect()),
    }
}

impl Serialize for Forest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let wire: Vec<CategoryOut<'_>> = self
            .categories
            .iter()
            .map(|c| CategoryOut {
                name: &c.name,
                subcategories: marker(&c.children, |s| SubcategoryOut {
                    name: &s.name,
                    sub_subcategories: marker(&s.children, |l| LeafOut { name: &l.name }),
                }),
            })
            .collect();
        wire.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Forest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let wire = Vec::<CategoryIn>::deserialize(deserializer)?;
        let categories = wire
            .into_iter()
            .map(|c| CategoryNode {
                name: c.name,
                depth: Depth::Category,
                children: Children::from_marker(c.subcategories.map(|subs| {
                    subs.into_iter()
                        .map(|s| CategoryNode {
                            name: s.name,
                            depth: Depth::Subcategory,
                            children: Children::from_marker(s.sub_subcategories.map(|leaves| {
                                leaves
                                    .into_iter()
                                    .map(|l| CategoryNode::new(l.name, Depth::SubSubcategory))
                                    .collect()
                            })),
                        })
                        .collect()
                })),
            })
            .collect();
        Forest::new(categories).map_err(serde::de::Error::custom)
    }
}

/// A tree document as exchanged with clients: `{"categories": [...]}`.
///
/// Extra keys such as `id` or a legacy `api_key` are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ForestDocument {
    #[serde(default)]
    pub categories: Forest,
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

/// A persisted taxonomy. Carries no classification credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Taxonomy {
    pub id: TaxonomyId,
    pub owner: Principal,
    /// Domain name, e.g. "Animals". Also the seed label for the first level.
    pub domain: String,
    /// Free-text context passed to every classification call.
    pub description: String,
    #[serde(rename = "categories")]
    pub forest: Forest,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Taxonomy {
    /// A new, empty taxonomy owned by `owner`.
    pub fn new(owner: Principal, domain: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: TaxonomyId::new(),
            owner,
            domain: domain.into(),
            description: description.into(),
            forest: Forest::empty(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn summary(&self) -> TaxonomySummary {
        TaxonomySummary {
            id: self.id,
            owner: self.owner.clone(),
            domain: self.domain.clone(),
            description: self.description.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Listing row for a taxonomy, without its tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaxonomySummary {
    pub id: TaxonomyId,
    pub owner: Principal,
    pub domain: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
