use crate::provider::MalformedEventPolicy;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Instructions sent with every request. Custom instructions are appended.
const BASE_SYSTEM_PROMPT: &str = "You are a helpful, concise assistant. Answer the user's \
request directly. When you are unsure, say so instead of guessing.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,

    /// Model id; the persisted selection wins when one exists.
    pub model: Option<String>,

    /// Provider endpoint override, e.g. a proxy. Either the API root
    /// (`https://api.anthropic.com`) or the full `/v1/messages` endpoint.
    pub base_url: Option<String>,

    pub custom_instructions: Option<String>,

    /// How long a cancellation may take before the task is abandoned.
    pub abort_grace_period_ms: u64,

    /// Keep partial assistant text when a turn is aborted.
    pub persist_partial_output: bool,

    pub malformed_events: MalformedEventPolicy,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .map(|d| d.join("tack"))
            .unwrap_or_else(|| PathBuf::from(".tack"));

        Self {
            data_dir,
            model: None,
            base_url: None,
            custom_instructions: None,
            abort_grace_period_ms: 3000,
            persist_partial_output: false,
            malformed_events: MalformedEventPolicy::Skip,
        }
    }
}

impl Config {
    /// Path to the history SQLite database.
    pub fn history_db_path(&self) -> PathBuf {
        self.data_dir.join("history.db")
    }

    /// Path to the secrets file.
    pub fn secrets_path(&self) -> PathBuf {
        self.data_dir.join("secrets.json")
    }

    pub fn abort_grace_period(&self) -> Duration {
        Duration::from_millis(self.abort_grace_period_ms)
    }

    pub fn system_prompt(&self) -> String {
        match self.custom_instructions.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => format!(
                "{BASE_SYSTEM_PROMPT}\n\n====\n\nUSER'S CUSTOM INSTRUCTIONS\n\n{custom}"
            ),
            _ => BASE_SYSTEM_PROMPT.to_string(),
        }
    }

    /// Location of the config file.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("tack").join("config.toml"))
            .unwrap_or_else(|| PathBuf::from(".tack/config.toml"))
    }

    pub fn load() -> anyhow::Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from a specific file, falling back to defaults when it is absent.
    pub fn load_from(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Invalid config file {}", path.display()))?;
            Ok(config)
        } else {
            Ok(Config::default())
        }
    }
}
