//! Core domain logic for taxogen.
//!
//! This crate ties the tree model, the classifier, and storage together:
//! - [`tree`] scans and merges forests
//! - [`engine`] runs concurrent expansion rounds
//! - [`service`] exposes owner-checked taxonomy operations

pub mod engine;
pub mod gateway;
pub mod service;
pub mod tree;

pub use engine::{
    ExpansionOutcome, ExpansionProgress, ExpansionRequest, Expander, RoundStats,
    SilentExpansionProgress, WaveKind, WaveStats,
};
pub use gateway::TaxonomyGateway;
pub use tree::{ForestStats, PendingNode};
