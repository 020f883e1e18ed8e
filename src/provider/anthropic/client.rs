//! Anthropic Messages API client.

use super::decoder::{EventStream, decode_stream};
use super::request::AnthropicRequest;
use crate::provider::client::LlmApi;
use crate::provider::error::Error;
use crate::provider::http::{ApiKeyAuth, HttpClient};
use crate::provider::models;
use crate::provider::types::{MalformedEventPolicy, Message};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};

pub const BASE_URL: &str = "https://api.anthropic.com";
const MESSAGES_PATH: &str = "/v1/messages";
const API_VERSION: &str = "2023-06-01";
const PROMPT_CACHING_BETA: &str = "prompt-caching-2024-07-31";

/// Native Anthropic Messages API client.
pub struct AnthropicClient {
    http: HttpClient,
    policy: MalformedEventPolicy,
}

impl AnthropicClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, BASE_URL)
    }

    /// Create a client against a custom endpoint (proxies, local gateways).
    ///
    /// Takes either the API root or the full messages endpoint.
    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let root = base_url.trim_end_matches('/');
        let root = root.strip_suffix(MESSAGES_PATH).unwrap_or(root);

        let mut headers = HeaderMap::new();
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));

        let http = HttpClient::with_default_headers(
            root,
            ApiKeyAuth {
                header: "x-api-key".to_string(),
                key: api_key.into(),
            },
            headers,
        );

        Self {
            http,
            policy: MalformedEventPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_malformed_policy(mut self, policy: MalformedEventPolicy) -> Self {
        self.policy = policy;
        self
    }
}

/// Per-request headers that depend on the model.
fn model_headers(model_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if models::supports_prompt_caching(model_id) {
        headers.insert(
            "anthropic-beta",
            HeaderValue::from_static(PROMPT_CACHING_BETA),
        );
    }
    headers
}

#[async_trait]
impl LlmApi for AnthropicClient {
    fn id(&self) -> &str {
        "anthropic"
    }

    async fn send(
        &self,
        system_prompt: &str,
        history: &[Message],
        model: Option<&str>,
    ) -> Result<EventStream, Error> {
        let model = models::resolve(model);
        let request = AnthropicRequest::streaming(model, system_prompt, history);

        tracing::debug!(
            model = %request.model,
            messages = request.messages.len(),
            max_tokens = request.max_tokens,
            "Anthropic API stream request"
        );

        let bytes = self
            .http
            .post_stream(MESSAGES_PATH, &request, model_headers(model.id))
            .await?;

        Ok(decode_stream(bytes, self.policy))
    }
}
