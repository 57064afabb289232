//! Shared types, error model, and configuration for taxogen.
//!
//! This crate is the foundation depended on by all other taxogen crates.
//! It provides:
//! - [`TaxogenError`]: the unified error type
//! - Domain types ([`Taxonomy`], [`Forest`], [`CategoryNode`], [`Children`], [`NodeId`])
//! - Configuration ([`AppConfig`], [`ExpansionConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassifierConfig, DefaultsConfig, ExpansionConfig, config_dir, config_file_path,
    database_path, init_config, load_config, load_config_from, validate_config,
};
pub use error::{Result, TaxogenError};
pub use types::{
    CategoryNode, Children, Depth, Forest, ForestDocument, NodeId, Principal, Taxonomy,
    TaxonomyId, TaxonomySummary,
};
