//! Application configuration

pub mod client;

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use client::{AssistantConfig, ConfigError, StoreKind};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Optional TOML file with [`AssistantConfig`]
    pub config_path: Option<PathBuf>,
    /// Overrides `backend.url` from the TOML file
    pub backend_url: Option<String>,
    pub api_key: Option<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            host: env::var("HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: env::var("PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(3000),
            data_dir: env::var("ASSET_CHAT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
            config_path: env::var("ASSET_CHAT_CONFIG").ok().map(PathBuf::from),
            backend_url: env::var("ASSET_CHAT_BACKEND_URL").ok(),
            api_key: env::var("ASSET_CHAT_API_KEY").ok(),
        })
    }

    /// Load the TOML assistant config (or defaults) and apply env overrides
    pub fn assistant(&self) -> anyhow::Result<AssistantConfig> {
        let mut assistant = match &self.config_path {
            Some(path) => AssistantConfig::from_file(path)?,
            None => AssistantConfig::default(),
        };

        if let Some(url) = &self.backend_url {
            assistant.backend.url = url.clone();
        }
        Ok(assistant)
    }
}
