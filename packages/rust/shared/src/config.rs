//! Application configuration for taxogen.
//!
//! User config lives at `~/.taxogen/taxogen.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, TaxogenError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "taxogen.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".taxogen";

// ---------------------------------------------------------------------------
// Config structs (matching taxogen.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Classification service settings.
    #[serde(default)]
    pub classifier: ClassifierConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file. `~` expands to the home directory.
    #[serde(default = "default_database_path")]
    pub database_path: String,

    /// Maximum classification calls in flight per wave.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Upper bound on one expansion round; 0 disables the limit.
    #[serde(default = "default_round_timeout")]
    pub round_timeout_secs: u64,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            concurrency: default_concurrency(),
            round_timeout_secs: default_round_timeout(),
        }
    }
}

fn default_database_path() -> String {
    "~/.taxogen/taxogen.db".into()
}
fn default_concurrency() -> u32 {
    8
}
fn default_round_timeout() -> u64 {
    120
}

/// `[classifier]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Chat model used for classification.
    #[serde(default = "default_model")]
    pub model: String,

    /// Base URL of an OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-call HTTP timeout.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            model: default_model(),
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_request_timeout() -> u64 {
    60
}

impl ClassifierConfig {
    /// Parse `base_url`, rejecting anything that is not http(s).
    pub fn base_url(&self) -> Result<Url> {
        let url = Url::parse(&self.base_url).map_err(|e| {
            TaxogenError::config(format!("invalid classifier base_url '{}': {e}", self.base_url))
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(TaxogenError::config(format!(
                "classifier base_url must be http or https, got '{other}'"
            ))),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ---------------------------------------------------------------------------
// Expansion config (runtime, merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime expansion configuration: merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct ExpansionConfig {
    /// Maximum classification calls in flight per wave.
    pub concurrency: usize,
    /// Abandon the round after this long.
    pub round_timeout: Option<Duration>,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for ExpansionConfig {
    fn from(config: &AppConfig) -> Self {
        let timeout = config.defaults.round_timeout_secs;
        Self {
            concurrency: config.defaults.concurrency.max(1) as usize,
            round_timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.taxogen/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| TaxogenError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.taxogen/taxogen.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| TaxogenError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        TaxogenError::config(format!("failed to parse {}: {e}", path.display()))
    })?;
    validate_config(&config)?;
    Ok(config)
}

/// Reject settings that cannot work at runtime.
pub fn validate_config(config: &AppConfig) -> Result<()> {
    if config.defaults.concurrency == 0 {
        return Err(TaxogenError::config("defaults.concurrency must be at least 1"));
    }
    config.classifier.base_url()?;
    Ok(())
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| TaxogenError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| TaxogenError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| TaxogenError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Resolve the configured database path, expanding a leading `~/`.
pub fn database_path(config: &AppConfig) -> Result<PathBuf> {
    expand_home(&config.defaults.database_path)
}

fn expand_home(raw: &str) -> Result<PathBuf> {
    match raw.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| TaxogenError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(raw)),
    }
}
