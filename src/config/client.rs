//! Assistant configuration loaded from TOML files
//!
//! Defines:
//! - Which assistant backend to stream from
//! - Where conversations are persisted
//! - How failed and stalled turns are handled
//!
//! Every section is optional; missing fields fall back to defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::{ManagerSettings, DEFAULT_APOLOGY};
use crate::providers::HttpBackendConfig;

/// Root assistant configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Assistant backend settings
    #[serde(default)]
    pub backend: BackendConfig,

    /// Conversation persistence settings
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Conversation manager behaviour
    #[serde(default)]
    pub conversation: ConversationConfig,
}

impl AssistantConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: AssistantConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend.url.trim().is_empty() {
            return Err(ConfigError::Validation("backend.url must not be empty".into()));
        }
        if self.persistence.key.trim().is_empty() {
            return Err(ConfigError::Validation("persistence.key must not be empty".into()));
        }
        if self.conversation.idle_timeout_secs == Some(0) {
            return Err(ConfigError::Validation(
                "conversation.idle_timeout_secs must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Assistant backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Base URL of the assistant service
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Environment variable holding the bearer token
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
}

fn default_backend_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_connect_timeout() -> u64 {
    10
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            api_key_env: None,
            connect_timeout_secs: default_connect_timeout(),
        }
    }
}

impl BackendConfig {
    /// Resolve into an HTTP backend config, reading the API key from the environment
    pub fn http_config(&self) -> HttpBackendConfig {
        HttpBackendConfig {
            base_url: self.url.clone(),
            api_key: self
                .api_key_env
                .as_deref()
                .and_then(|name| std::env::var(name).ok()),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

/// Where the conversation slot lives
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    #[default]
    Sqlite,
    File,
    Memory,
}

/// Persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default)]
    pub store: StoreKind,

    /// Database file (sqlite) or directory (file). Relative to the data dir.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Slot key for this conversation
    #[serde(default = "default_key")]
    pub key: String,
}

fn default_key() -> String {
    "portfolio-assistant".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::default(),
            path: None,
            key: default_key(),
        }
    }
}

impl PersistenceConfig {
    /// Resolve the storage location under `data_dir`
    pub fn location(&self, data_dir: &Path) -> PathBuf {
        let default = match self.store {
            StoreKind::Sqlite => PathBuf::from("conversations.db"),
            StoreKind::File | StoreKind::Memory => PathBuf::from("conversations"),
        };
        data_dir.join(self.path.clone().unwrap_or(default))
    }
}

/// Conversation manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Text shown in place of a failed answer
    #[serde(default = "default_apology")]
    pub apology: String,

    /// Fail a turn if no chunk arrives for this many seconds. Unset waits forever.
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

fn default_apology() -> String {
    DEFAULT_APOLOGY.to_string()
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            apology: default_apology(),
            idle_timeout_secs: None,
        }
    }
}

impl ConversationConfig {
    pub fn manager_settings(&self) -> ManagerSettings {
        ManagerSettings {
            apology: self.apology.clone(),
            idle_timeout: self.idle_timeout_secs.map(Duration::from_secs),
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
