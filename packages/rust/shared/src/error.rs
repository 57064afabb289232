//! Error types for taxogen.
//!
//! Library crates use [`TaxogenError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all taxogen operations.
#[derive(Debug, thiserror::Error)]
pub enum TaxogenError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while talking to the classification service.
    #[error("network error: {0}")]
    Network(String),

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// A single classification call failed (bad status, malformed body).
    ///
    /// Never returned from an expansion round directly; a round only fails
    /// with [`TaxogenError::ClassificationFailed`].
    #[error("classification error: {0}")]
    Classification(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (blank names, malformed tree document, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// The taxonomy identifier does not resolve.
    #[error("taxonomy {id} not found")]
    NotFound { id: String },

    /// The caller does not own the taxonomy.
    #[error("not authorized for taxonomy {id}")]
    NotAuthorized { id: String },

    /// A non-empty wave produced no usable result, the seed call failed,
    /// or the round was cancelled.
    #[error("classification failed: {reason}")]
    ClassificationFailed { reason: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, TaxogenError>;

impl TaxogenError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn not_found(id: impl ToString) -> Self {
        Self::NotFound { id: id.to_string() }
    }

    pub fn not_authorized(id: impl ToString) -> Self {
        Self::NotAuthorized { id: id.to_string() }
    }

    pub fn classification_failed(reason: impl Into<String>) -> Self {
        Self::ClassificationFailed {
            reason: reason.into(),
        }
    }
}
