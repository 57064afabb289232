//! Forest traversal and merging.
//!
//! The engine never mutates a forest in place while a wave is running: it
//! scans with [`nodes_needing_expansion`], collects results, then builds a new
//! forest with [`merge_children`] once every worker has finished.

use std::collections::HashMap;

use taxogen_shared::{CategoryNode, Children, Depth, Forest, NodeId, Result, TaxogenError};

/// A node whose children were requested but not fetched yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingNode {
    pub id: NodeId,
    pub name: String,
}

/// Nodes at `depth` whose children are `Requested`, in document order.
///
/// Leaves never need expansion, so `SubSubcategory` always yields nothing.
pub fn nodes_needing_expansion(forest: &Forest, depth: Depth) -> Vec<PendingNode> {
    match depth {
        Depth::Category => forest
            .categories()
            .iter()
            .enumerate()
            .filter(|(_, c)| c.needs_expansion())
            .map(|(i, c)| PendingNode {
                id: NodeId::Category(i),
                name: c.name.clone(),
            })
            .collect(),
        Depth::Subcategory => forest
            .categories()
            .iter()
            .enumerate()
            .flat_map(|(i, c)| {
                c.children
                    .nodes()
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.needs_expansion())
                    .map(move |(j, s)| PendingNode {
                        id: NodeId::Subcategory(i, j),
                        name: s.name.clone(),
                    })
            })
            .collect(),
        Depth::SubSubcategory => Vec::new(),
    }
}

/// Return a copy of `forest` with classified children filled in.
///
/// Only nodes still marked `Requested` are touched. New children are fresh
/// nodes one level down. A node whose result has no usable name stays
/// `Requested`. The result is independent of map iteration order.
pub fn merge_children(forest: &Forest, results: &HashMap<NodeId, Vec<String>>) -> Forest {
    let mut merged = forest.clone();
    for (id, names) in results {
        let Some(node) = merged.get_mut(*id) else {
            continue;
        };
        let Some(child_depth) = node.depth.child() else {
            continue;
        };
        if !node.children.is_requested() {
            continue;
        }
        let children: Vec<CategoryNode> = normalize_names(names)
            .into_iter()
            .map(|name| CategoryNode::fresh(name, child_depth))
            .collect();
        if !children.is_empty() {
            node.children = Children::Populated(children);
        }
    }
    merged
}

/// Trim classifier output and drop blank names, keeping order.
pub fn normalize_names(names: &[String]) -> Vec<String> {
    names
        .iter()
        .map(|n| n.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Mark the node at `path` as wanting children.
///
/// Already-requested nodes are left as they are. Populated nodes are an error.
pub fn request_children(forest: &mut Forest, path: &[&str]) -> Result<NodeId> {
    let id = forest.find(path).ok_or_else(|| {
        TaxogenError::validation(format!("no expandable node at '{}'", path.join("/")))
    })?;
    let node = forest
        .get_mut(id)
        .ok_or_else(|| TaxogenError::validation(format!("node {id} vanished")))?;

    match node.children {
        Children::Unrequested => node.children = Children::Requested,
        Children::Requested => {}
        Children::Populated(_) => {
            return Err(TaxogenError::validation(format!(
                "'{}' already has children",
                node.name
            )));
        }
    }
    Ok(id)
}

/// Mark every unrequested node at `depth` as wanting children.
///
/// Returns how many nodes changed.
pub fn request_all(forest: &mut Forest, depth: Depth) -> usize {
    let mut marked = 0;
    let mut mark = |node: &mut CategoryNode| {
        if node.children.is_unrequested() && node.depth.child().is_some() {
            node.children = Children::Requested;
            marked += 1;
        }
    };

    for category in forest.categories_mut() {
        match depth {
            Depth::Category => mark(category),
            Depth::Subcategory => {
                if let Children::Populated(subs) = &mut category.children {
                    subs.iter_mut().for_each(&mut mark);
                }
            }
            Depth::SubSubcategory => {}
        }
    }
    marked
}

/// Node counts per level plus outstanding requests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForestStats {
    pub categories: usize,
    pub subcategories: usize,
    pub sub_subcategories: usize,
    /// Nodes whose children are `Requested`.
    pub pending: usize,
}

impl ForestStats {
    pub fn of(forest: &Forest) -> Self {
        let mut stats = Self {
            categories: forest.len(),
            ..Self::default()
        };
        for category in forest.categories() {
            stats.pending += usize::from(category.needs_expansion());
            for sub in category.children.nodes() {
                stats.subcategories += 1;
                stats.pending += usize::from(sub.needs_expansion());
                stats.sub_subcategories += sub.children.nodes().len();
            }
        }
        stats
    }

    pub fn is_settled(&self) -> bool {
        self.pending == 0
    }
}
