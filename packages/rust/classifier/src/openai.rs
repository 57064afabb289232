//! OpenAI-compatible chat-completions classifier.
//!
//! Asks the model for a strict JSON object `{"categories": [{"name": ...}]}`
//! via a `json_schema` response format and returns the names in order.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use taxogen_shared::{ClassifierConfig, Result, TaxogenError};

use crate::{ApiKey, Classifier, ClassifyRequest};

/// User-Agent string for classification requests.
const USER_AGENT: &str = concat!("taxogen/", env!("CARGO_PKG_VERSION"));

/// How much of an error body to keep in messages.
const ERROR_BODY_PREVIEW: usize = 200;

/// Classifier backed by an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClassifier {
    client: Client,
    endpoint: Url,
    model: String,
}

impl OpenAiClassifier {
    /// Build a classifier from the `[classifier]` config section.
    pub fn new(config: &ClassifierConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| TaxogenError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: completions_endpoint(config.base_url()?)?,
            model: config.model.clone(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request_body(&self, request: &ClassifyRequest) -> serde_json::Value {
        serde_json::json!({
            "model": &self.model,
            "messages": [
                {"role": "system", "content": system_prompt(request)},
                {"role": "user", "content": user_prompt(request)},
            ],
            "response_format": {
                "type": "json_schema",
                "json_schema": {
                    "name": "taxonomy_response",
                    "strict": true,
                    "schema": {
                        "type": "object",
                        "properties": {
                            "categories": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "properties": {"name": {"type": "string"}},
                                    "required": ["name"],
                                    "additionalProperties": false,
                                },
                            },
                        },
                        "required": ["categories"],
                        "additionalProperties": false,
                    },
                },
            },
        })
    }
}

#[async_trait]
impl Classifier for OpenAiClassifier {
    #[instrument(skip_all, fields(label = %request.label, model = %self.model))]
    async fn classify(
        &self,
        credential: &ApiKey,
        request: &ClassifyRequest,
    ) -> Result<Vec<String>> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(credential.expose())
            .json(&self.request_body(request))
            .send()
            .await
            .map_err(|e| TaxogenError::Network(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TaxogenError::Classification(format!(
                "HTTP {status}: {}",
                preview(&body)
            )));
        }

        let completion: ChatCompletion = response
            .json()
            .await
            .map_err(|e| TaxogenError::Classification(format!("invalid completion body: {e}")))?;

        let names = parse_completion(completion)?;
        debug!(children = names.len(), "classification succeeded");
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

fn system_prompt(request: &ClassifyRequest) -> String {
    format!(
        "You help users build a taxonomy for '{}' in the context '{}'. \
         Reply with brief, professional answers and no elaboration.",
        request.domain, request.context
    )
}

fn user_prompt(request: &ClassifyRequest) -> String {
    format!(
        "List the categories of '{}' in this context: '{}'. \
         Answer in the language of the context.",
        request.label, request.context
    )
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Message {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CategoryList {
    categories: Vec<NamedCategory>,
}

#[derive(Debug, Deserialize)]
struct NamedCategory {
    name: String,
}

/// Pull the category names out of the first choice's JSON content.
fn parse_completion(completion: ChatCompletion) -> Result<Vec<String>> {
    let content = completion
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| TaxogenError::Classification("completion has no content".into()))?;

    let list: CategoryList = serde_json::from_str(&content).map_err(|e| {
        TaxogenError::Classification(format!(
            "content is not a category list: {e} (got: {})",
            preview(&content)
        ))
    })?;

    Ok(list.categories.into_iter().map(|c| c.name).collect())
}

/// `<base>/chat/completions`, keeping any path prefix such as `/v1`.
fn completions_endpoint(mut base: Url) -> Result<Url> {
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    base.join("chat/completions")
        .map_err(|e| TaxogenError::config(format!("invalid classifier endpoint: {e}")))
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(ERROR_BODY_PREVIEW) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
