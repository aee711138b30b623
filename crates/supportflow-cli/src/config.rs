//! Application configuration.
//!
//! Read from `config/default.toml` (or `--config`), then overlaid with
//! environment variables, optionally from a `.env` file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use supportflow_adapters::OpenAiConfig;
use supportflow_engine::EngineConfig;

pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub channels: ChannelsConfig,
    pub ai: OpenAiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/supportflow.db"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub telegram_bot_token: Option<String>,
    /// Platform name to webhook URL.
    pub webhooks: BTreeMap<String, String>,
    /// Log deliveries instead of sending them.
    pub dry_run: bool,
}

impl AppConfig {
    /// Load the configuration file and apply environment overrides.
    ///
    /// A missing default file yields defaults; a missing explicit
    /// `--config` file is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = explicit.unwrap_or(Path::new(DEFAULT_CONFIG_PATH));
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            Self::from_toml(&content).with_context(|| format!("invalid config {}", path.display()))?
        } else if explicit.is_some() {
            anyhow::bail!("config file {} does not exist", path.display());
        } else {
            Self::default()
        };

        dotenvy::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Overlay secrets and paths from the environment. Empty values are
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(path) = get("SUPPORTFLOW_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(token) = get("SUPPORTFLOW_TELEGRAM_TOKEN") {
            self.channels.telegram_bot_token = Some(token);
        }
        if let Some(key) = get("SUPPORTFLOW_AI_API_KEY").or_else(|| get("OPENAI_API_KEY")) {
            self.ai.api_key = key;
        }
        if let Some(url) = get("SUPPORTFLOW_AI_BASE_URL") {
            self.ai.base_url = url;
        }
    }
}
