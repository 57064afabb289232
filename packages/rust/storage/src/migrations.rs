//! SQL migration definitions for the taxogen database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: taxonomies",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- One row per taxonomy; the tree is the JSON document form of the forest
CREATE TABLE IF NOT EXISTS taxonomies (
    id          TEXT PRIMARY KEY,
    owner       TEXT NOT NULL,
    domain      TEXT NOT NULL,
    description TEXT NOT NULL,
    tree_json   TEXT NOT NULL DEFAULT '[]',
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_taxonomies_owner ON taxonomies(owner);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
