//! Shared types for the provider layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Normalized unit of provider output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    TextDelta(String),
    UsageDelta(UsageDelta),
    /// A `data:` line that could not be parsed. Only produced when the
    /// decoder runs with [`MalformedEventPolicy::Surface`].
    Malformed(String),
}

/// Token counts reported by a single stream event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsageDelta {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cache_write_tokens: Option<u32>,
    pub cache_read_tokens: Option<u32>,
}

/// What the decoder does with a `data:` line it cannot parse.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MalformedEventPolicy {
    /// Log and drop the line.
    #[default]
    Skip,
    /// Log the line and emit [`StreamEvent::Malformed`].
    Surface,
}

/// Running token accounting for one task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageTotals {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_write_tokens: u64,
    pub cache_read_tokens: u64,
}

impl UsageTotals {
    /// Fold a usage delta into the totals. Totals never decrease.
    pub fn add(&mut self, delta: &UsageDelta) {
        self.input_tokens += u64::from(delta.input_tokens);
        self.output_tokens += u64::from(delta.output_tokens);
        self.cache_write_tokens += u64::from(delta.cache_write_tokens.unwrap_or(0));
        self.cache_read_tokens += u64::from(delta.cache_read_tokens.unwrap_or(0));
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One entry of a task transcript.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Static description of a model the client can talk to.
///
/// Prices are per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelInfo {
    pub id: &'static str,
    pub max_tokens: u32,
    pub context_window: u32,
    pub supports_images: bool,
    pub supports_prompt_cache: bool,
    pub input_price: f64,
    pub output_price: f64,
    pub cache_writes_price: f64,
    pub cache_reads_price: f64,
}

impl ModelInfo {
    /// Cost of the given usage with this model's prices.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost(&self, usage: &UsageTotals) -> f64 {
        let per_k = |tokens: u64, price: f64| tokens as f64 / 1000.0 * price;
        per_k(usage.input_tokens, self.input_price)
            + per_k(usage.output_tokens, self.output_price)
            + per_k(usage.cache_write_tokens, self.cache_writes_price)
            + per_k(usage.cache_read_tokens, self.cache_reads_price)
    }
}
