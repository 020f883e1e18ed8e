//! API configuration and client construction.

use super::anthropic::{AnthropicClient, BASE_URL};
use super::client::LlmApi;
use super::types::MalformedEventPolicy;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::Arc;

/// Environment variable consulted when no key is stored.
pub const API_KEY_ENV_VAR: &str = "ANTHROPIC_API_KEY";

/// Credential, model selection and endpoint for the provider.
#[derive(Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiConfiguration {
    pub api_key: Option<String>,
    pub model_id: Option<String>,
    pub base_url: Option<String>,
}

impl std::fmt::Debug for ApiConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfiguration")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("model_id", &self.model_id)
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiConfiguration {
    /// Returns a displayable problem, or `None` when the configuration is usable.
    #[must_use]
    pub fn validate(&self) -> Option<String> {
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => None,
            _ => Some("You must provide a valid API key.".to_string()),
        }
    }

    /// Fill a missing key from the environment.
    #[must_use]
    pub fn with_env_fallback(mut self) -> Self {
        if self.api_key.as_deref().is_none_or(str::is_empty) {
            self.api_key = env_api_key();
        }
        self
    }
}

/// Get the API key from the environment, if set and non-empty.
pub fn env_api_key() -> Option<String> {
    env::var(API_KEY_ENV_VAR).ok().filter(|k| !k.is_empty())
}

/// Build the client for a configuration.
pub fn build_api(config: &ApiConfiguration, policy: MalformedEventPolicy) -> Arc<dyn LlmApi> {
    let key = config.api_key.clone().unwrap_or_default();
    let base_url = config.base_url.as_deref().unwrap_or(BASE_URL);
    Arc::new(AnthropicClient::with_base_url(key, base_url).with_malformed_policy(policy))
}
