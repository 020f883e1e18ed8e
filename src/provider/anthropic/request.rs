//! Anthropic API request types.

use crate::provider::types::{Message, ModelInfo};
use serde::Serialize;

/// Top-level request to the Anthropic Messages API.
#[derive(Debug, Serialize)]
pub struct AnthropicRequest {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system: String,
    pub messages: Vec<AnthropicMessage>,
    pub stream: bool,
}

/// A message in the conversation.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct AnthropicMessage {
    pub role: &'static str,
    pub content: String,
}

impl AnthropicRequest {
    /// Build a streaming request for `model`.
    ///
    /// Empty turns are left out and adjacent turns from the same role are
    /// joined; the API rejects both.
    pub fn streaming(model: &ModelInfo, system: &str, history: &[Message]) -> Self {
        let mut messages: Vec<AnthropicMessage> = Vec::with_capacity(history.len());
        for m in history.iter().filter(|m| !m.content.is_empty()) {
            match messages.last_mut() {
                Some(last) if last.role == m.role.as_str() => {
                    last.content.push_str("\n\n");
                    last.content.push_str(&m.content);
                }
                _ => messages.push(AnthropicMessage {
                    role: m.role.as_str(),
                    content: m.content.clone(),
                }),
            }
        }

        Self {
            model: model.id.to_string(),
            max_tokens: model.max_tokens,
            temperature: 0.0,
            system: system.to_string(),
            messages,
            stream: true,
        }
    }
}
