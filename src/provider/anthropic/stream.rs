//! Anthropic streaming event types.
//!
//! Every field the decoder does not strictly need is optional or defaulted so a
//! record that is valid JSON never fails to parse over a missing counter.

use serde::Deserialize;

/// Streaming event from the Anthropic Messages API.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    #[serde(rename = "message_start")]
    MessageStart { message: MessageStart },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Usage,
    },
    #[serde(rename = "content_block_start")]
    ContentBlockStart { content_block: ContentBlockInfo },
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: ContentDelta },
    /// `ping`, `message_stop`, `content_block_stop`, `error` and anything newer.
    #[serde(other)]
    Other,
}

/// Initial message info.
#[derive(Debug, Default, Deserialize)]
pub struct MessageStart {
    #[serde(default)]
    pub usage: Usage,
}

/// Token usage information.
#[derive(Debug, Default, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    pub cache_creation_input_tokens: Option<u32>,
    pub cache_read_input_tokens: Option<u32>,
}

/// Content block type info at start.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlockInfo {
    #[serde(rename = "text")]
    Text {
        #[serde(default)]
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Delta update for a content block.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ContentDelta {
    #[serde(rename = "text_delta")]
    Text { text: String },
    #[serde(other)]
    Other,
}
