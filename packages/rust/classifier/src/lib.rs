//! Classification service client for taxogen.
//!
//! This crate provides:
//! - [`Classifier`]: the async seam the expansion engine calls, once per node
//! - [`ApiKey`]: the request-scoped credential, never serialized or logged
//! - [`OpenAiClassifier`]: an OpenAI-compatible chat-completions implementation

mod openai;

use async_trait::async_trait;
use taxogen_shared::{AppConfig, Result, TaxogenError};

pub use openai::OpenAiClassifier;

/// One "what are the children of this label?" question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifyRequest {
    /// Taxonomy domain, e.g. "Animals".
    pub domain: String,
    /// Free-text context the taxonomy is built for.
    pub context: String,
    /// The category whose children are wanted.
    pub label: String,
}

/// Produces ordered child-category names for a label.
///
/// Implementations must be safe to call concurrently with independent requests.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, credential: &ApiKey, request: &ClassifyRequest)
    -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// ApiKey
// ---------------------------------------------------------------------------

/// Credential for the classification service, scoped to one request.
///
/// Deliberately has no `Serialize` impl and a redacted `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// The raw key, for building the `Authorization` header.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey(***)")
    }
}

/// Read the API key from the env var named in the config.
pub fn resolve_api_key(config: &AppConfig) -> Result<ApiKey> {
    let var_name = &config.classifier.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(ApiKey::new(val.trim())),
        _ => Err(TaxogenError::config(format!(
            "classifier API key not found. Set the {var_name} environment variable."
        ))),
    }
}
