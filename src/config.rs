//! Configuration management
//!
//! Settings live in `~/.maestro/config.json`. A missing file means defaults;
//! every field is optional in the file.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::Result;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for the token cache, master key and database
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// SQLite URL; `sqlite://<data_dir>/maestro.db` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Named session used when none is given
    #[serde(default = "default_session")]
    pub default_session: String,

    /// Timeout applied to every vendor HTTP request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default)]
    pub providers: ProvidersConfig,

    /// OAuth client overrides keyed by provider name
    #[serde(default)]
    pub oauth: HashMap<String, OAuthOverride>,
}

/// Per-vendor request settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    #[serde(default)]
    pub anthropic: ProviderSettings,

    #[serde(default)]
    pub openai: ProviderSettings,

    #[serde(default)]
    pub gemini: GeminiSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Default model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// API base URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeminiSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Public Generative Language API base URL (API-key traffic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,

    /// Code Assist base URL (OAuth and service-account traffic)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_assist_url: Option<String>,

    /// Delay between `onboardUser` polls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboard_poll_interval_ms: Option<u64>,

    /// Maximum `onboardUser` polls before giving up
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onboard_max_attempts: Option<u32>,
}

/// OAuth client overrides for one provider
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OAuthOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_url: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_url: Option<String>,

    /// Device-flow redirect target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    /// Web-flow callback
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_redirect_uri: Option<String>,
}

fn default_data_dir() -> PathBuf {
    config_dir()
}

fn default_session() -> String {
    crate::auth::DEFAULT_SESSION.to_string()
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            database_url: None,
            default_session: default_session(),
            request_timeout_secs: default_request_timeout(),
            providers: ProvidersConfig::default(),
            oauth: HashMap::new(),
        }
    }
}

impl Config {
    pub fn database_url(&self) -> String {
        self.database_url.clone().unwrap_or_else(|| {
            format!("sqlite://{}", self.data_dir.join("maestro.db").display())
        })
    }

    pub fn master_key_path(&self) -> PathBuf {
        self.data_dir.join("master.key")
    }
}

/// Get the config directory path
pub fn config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".maestro")
}

/// Get the config file path
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

/// Load configuration from the default location
pub fn load() -> Result<Config> {
    load_from(&config_path())
}

/// Load configuration from `path`, falling back to defaults when missing
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        tracing::debug!("No config at {:?}, using defaults", path);
        return Ok(Config::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save configuration to `path`
pub fn save_to(config: &Config, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
