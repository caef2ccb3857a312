//! Process-level runtime configuration (paths, secrets, log level).
//!
//! This is distinct from [`crate::content`], which loads the *domain*
//! configuration (activity/levels/rewards JSON) the engine grades against.
//! Precedence: environment variables > `runtime.toml` file > built-in
//! defaults, matching the teacher's `env > file > defaults` convention.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default SQLite database file, relative to the runtime data directory.
const DEFAULT_DB_FILENAME: &str = "promptgate.db";

/// Default directory holding the three content JSON documents.
const DEFAULT_CONFIG_DIR: &str = "config";

/// Default directory for rotated log files.
const DEFAULT_LOGS_DIR: &str = "logs";

/// Top-level runtime configuration, loaded from `runtime.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Filesystem paths used by the process.
    pub paths: PathsConfig,
    /// Telegram channel credentials.
    pub telegram: TelegramConfig,
    /// LLM API credentials.
    pub llm: LlmSecretsConfig,
}

impl RuntimeConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$PROMPTGATE_RUNTIME_CONFIG` or `./runtime.toml`.
    ///
    /// # Errors
    ///
    /// Returns an error if a present config file cannot be parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = std::env::var("PROMPTGATE_RUNTIME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("runtime.toml"));

        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading runtime config from file");
                toml::from_str(&contents).context("failed to parse runtime.toml")
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no runtime.toml found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read runtime config {}: {e}",
                path.display()
            )),
        }
    }

    /// Apply environment variable overrides (env > file > defaults).
    ///
    /// Takes a resolver function for testability (avoids `set_var` races).
    fn apply_env_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("PROMPTGATE_DB_PATH") {
            self.paths.db_path = v;
        }
        if let Some(v) = env("PROMPTGATE_CONFIG_DIR") {
            self.paths.config_dir = v;
        }
        if let Some(v) = env("PROMPTGATE_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        if let Some(v) = env("PROMPTGATE_TELEGRAM_BOT_TOKEN") {
            self.telegram.bot_token = Some(v);
        }
        if let Some(v) = env("PROMPTGATE_LLM_API_KEY") {
            self.llm.api_key = Some(v);
        }
    }
}

/// Filesystem paths used by the process.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database file path.
    pub db_path: String,
    /// Directory holding `activity.json`, `levels.json`, `rewards.json`.
    pub config_dir: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let base = directories::BaseDirs::new();
        let data_root = base
            .as_ref()
            .map(|b| b.data_local_dir().join("promptgate"))
            .unwrap_or_else(|| PathBuf::from("."));

        Self {
            db_path: data_root.join(DEFAULT_DB_FILENAME).display().to_string(),
            config_dir: DEFAULT_CONFIG_DIR.to_string(),
            logs_dir: data_root.join(DEFAULT_LOGS_DIR).display().to_string(),
        }
    }
}

/// Telegram channel credentials.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token. Usually supplied via `PROMPTGATE_TELEGRAM_BOT_TOKEN`.
    pub bot_token: Option<String>,
}

/// LLM API credentials. The model identifier itself lives in the
/// `activity.json` content document, not here (spec §3 Activity).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LlmSecretsConfig {
    /// API key. Usually supplied via `PROMPTGATE_LLM_API_KEY`.
    pub api_key: Option<String>,
}
