//! libSQL storage layer for taxonomies (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database holding one row per
//! taxonomy: its owner, domain, description, and the category tree as a JSON
//! document.
//!
//! **Access rules:**
//! - Mutating commands: read-write via [`Storage::open`]
//! - Listing/inspection: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use tracing::instrument;

use taxogen_shared::{
    Forest, Principal, Result, TaxogenError, Taxonomy, TaxonomyId, TaxonomySummary,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TaxogenError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(TaxogenError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;

        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        TaxogenError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(TaxogenError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Taxonomy operations
    // -----------------------------------------------------------------------

    /// Insert a new taxonomy record, tree included.
    pub async fn insert_taxonomy(&self, taxonomy: &Taxonomy) -> Result<()> {
        self.check_writable()?;
        let tree_json = forest_to_json(&taxonomy.forest)?;
        self.conn
            .execute(
                "INSERT INTO taxonomies (id, owner, domain, description, tree_json, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    taxonomy.id.to_string(),
                    taxonomy.owner.as_str(),
                    taxonomy.domain.as_str(),
                    taxonomy.description.as_str(),
                    tree_json,
                    taxonomy.created_at.to_rfc3339(),
                    taxonomy.updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Load a taxonomy by ID.
    pub async fn get_taxonomy(&self, id: &TaxonomyId) -> Result<Option<Taxonomy>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, owner, domain, description, created_at, updated_at, tree_json
                 FROM taxonomies WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => {
                let summary = row_to_summary(&row)?;
                let tree_json: String = row.get(6).map_err(db_err)?;
                let forest: Forest = serde_json::from_str(&tree_json).map_err(|e| {
                    TaxogenError::Storage(format!("corrupt tree for taxonomy {id}: {e}"))
                })?;
                Ok(Some(Taxonomy {
                    id: summary.id,
                    owner: summary.owner,
                    domain: summary.domain,
                    description: summary.description,
                    forest,
                    created_at: summary.created_at,
                    updated_at: summary.updated_at,
                }))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// Owner of a taxonomy, or `None` if the ID does not resolve.
    pub async fn owner_of(&self, id: &TaxonomyId) -> Result<Option<Principal>> {
        let mut rows = self
            .conn
            .query(
                "SELECT owner FROM taxonomies WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Principal::new(row.get::<String>(0).map_err(db_err)?))),
            Ok(None) => Ok(None),
            Err(e) => Err(db_err(e)),
        }
    }

    /// List an owner's taxonomies, newest first, without their trees.
    pub async fn list_taxonomies(&self, owner: &Principal) -> Result<Vec<TaxonomySummary>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, owner, domain, description, created_at, updated_at
                 FROM taxonomies WHERE owner = ?1 ORDER BY id DESC",
                params![owner.as_str()],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_summary(&row)?);
        }
        Ok(results)
    }

    /// Replace a taxonomy's tree and bump `updated_at`.
    ///
    /// Returns the new `updated_at`; `NotFound` if no row matched.
    pub async fn store_forest(&self, id: &TaxonomyId, forest: &Forest) -> Result<DateTime<Utc>> {
        self.check_writable()?;
        let now = Utc::now();
        let changed = self
            .conn
            .execute(
                "UPDATE taxonomies SET tree_json = ?1, updated_at = ?2 WHERE id = ?3",
                params![forest_to_json(forest)?, now.to_rfc3339(), id.to_string()],
            )
            .await
            .map_err(db_err)?;

        if changed == 0 {
            return Err(TaxogenError::not_found(id));
        }
        Ok(now)
    }

    /// Delete a taxonomy. Returns whether a row was removed.
    pub async fn delete_taxonomy(&self, id: &TaxonomyId) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "DELETE FROM taxonomies WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }
}

fn db_err(e: libsql::Error) -> TaxogenError {
    TaxogenError::Storage(e.to_string())
}

fn forest_to_json(forest: &Forest) -> Result<String> {
    serde_json::to_string(forest)
        .map_err(|e| TaxogenError::Storage(format!("failed to encode tree: {e}")))
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| TaxogenError::Storage(format!("invalid date: {e}")))
}

/// Convert the leading summary columns of a row to a [`TaxonomySummary`].
fn row_to_summary(row: &libsql::Row) -> Result<TaxonomySummary> {
    let id: String = row.get(0).map_err(db_err)?;
    Ok(TaxonomySummary {
        id: id
            .parse()
            .map_err(|e| TaxogenError::Storage(format!("invalid taxonomy id '{id}': {e}")))?,
        owner: Principal::new(row.get::<String>(1).map_err(db_err)?),
        domain: row.get::<String>(2).map_err(db_err)?,
        description: row.get::<String>(3).map_err(db_err)?,
        created_at: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
        updated_at: parse_timestamp(&row.get::<String>(5).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use taxogen_shared::{CategoryNode, Children, Depth};
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("taxogen_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn animals(owner: &str) -> Taxonomy {
        Taxonomy::new(Principal::new(owner), "Animals", "Biology")
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("taxogen_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn taxonomy_crud() {
        let storage = test_storage().await;
        let taxonomy = animals("alice");
        storage.insert_taxonomy(&taxonomy).await.expect("insert");

        let loaded = storage
            .get_taxonomy(&taxonomy.id)
            .await
            .expect("get")
            .expect("present");
        assert_eq!(loaded.domain, "Animals");
        assert_eq!(loaded.description, "Biology");
        assert!(loaded.forest.is_empty());

        assert_eq!(
            storage.owner_of(&taxonomy.id).await.unwrap(),
            Some(Principal::new("alice"))
        );
        assert_eq!(storage.owner_of(&TaxonomyId::new()).await.unwrap(), None);

        assert!(storage.delete_taxonomy(&taxonomy.id).await.expect("delete"));
        assert!(storage.get_taxonomy(&taxonomy.id).await.unwrap().is_none());
        assert!(!storage.delete_taxonomy(&taxonomy.id).await.unwrap());
    }

    #[tokio::test]
    async fn store_forest_preserves_markers() {
        let storage = test_storage().await;
        let taxonomy = animals("alice");
        storage.insert_taxonomy(&taxonomy).await.unwrap();

        let forest = Forest::new(vec![
            CategoryNode::fresh("Mammals", Depth::Category),
            CategoryNode {
                name: "Birds".into(),
                depth: Depth::Category,
                children: Children::Populated(vec![CategoryNode::new(
                    "Passeriformes",
                    Depth::Subcategory,
                )]),
            },
        ])
        .unwrap();

        let updated_at = storage
            .store_forest(&taxonomy.id, &forest)
            .await
            .expect("store");
        assert!(updated_at >= taxonomy.updated_at);

        let loaded = storage.get_taxonomy(&taxonomy.id).await.unwrap().unwrap();
        assert_eq!(loaded.forest, forest);
        assert!(loaded.forest.categories()[0].children.is_requested());
        assert!(loaded.forest.categories()[1].children.nodes()[0]
            .children
            .is_unrequested());
    }

    #[tokio::test]
    async fn store_forest_for_unknown_id_is_not_found() {
        let storage = test_storage().await;
        let err = storage
            .store_forest(&TaxonomyId::new(), &Forest::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, TaxogenError::NotFound { .. }));
    }

    #[tokio::test]
    async fn list_is_scoped_to_owner() {
        let storage = test_storage().await;
        storage.insert_taxonomy(&animals("alice")).await.unwrap();
        storage.insert_taxonomy(&animals("alice")).await.unwrap();
        storage.insert_taxonomy(&animals("bob")).await.unwrap();

        let mine = storage
            .list_taxonomies(&Principal::new("alice"))
            .await
            .expect("list");
        assert_eq!(mine.len(), 2);
        assert!(mine.iter().all(|t| t.owner.as_str() == "alice"));
    }

    #[tokio::test]
    async fn list_surfaces_unreadable_rows() {
        let storage = test_storage().await;
        storage.insert_taxonomy(&animals("alice")).await.unwrap();
        storage
            .conn
            .execute(
                "INSERT INTO taxonomies (id, owner, domain, description, created_at, updated_at)
                 VALUES ('not-a-uuid', 'alice', 'Plants', '', 'yesterday', 'yesterday')",
                params![],
            )
            .await
            .unwrap();

        let err = storage
            .list_taxonomies(&Principal::new("alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, TaxogenError::Storage(_)));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("taxogen_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        let taxonomy = animals("alice");
        rw.insert_taxonomy(&taxonomy).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert!(ro.get_taxonomy(&taxonomy.id).await.unwrap().is_some());
        let result = ro.store_forest(&taxonomy.id, &Forest::empty()).await;
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }

    #[tokio::test]
    async fn readonly_requires_existing_file() {
        let tmp = std::env::temp_dir().join(format!("taxogen_missing_{}.db", Uuid::now_v7()));
        assert!(Storage::open_readonly(&tmp).await.is_err());
    }
}
