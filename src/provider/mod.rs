//! LLM provider abstraction.
//!
//! Turns a conversation into one streaming request and the provider's
//! event-stream body into a uniform sequence of [`StreamEvent`]s.
//!
//! # Example
//!
//! ```ignore
//! use tack::provider::{AnthropicClient, LlmApi, Message};
//!
//! let client = AnthropicClient::new(api_key);
//! let mut events = client.send("You are helpful.", &[Message::user("Hi")], None).await?;
//! while let Some(event) = events.next().await { /* ... */ }
//! ```

mod anthropic;
mod api_provider;
mod client;
mod error;
mod http;
pub mod models;
mod types;

pub use anthropic::{AnthropicClient, EventStream, StreamDecoder, decode_stream};
pub use api_provider::{API_KEY_ENV_VAR, ApiConfiguration, build_api, env_api_key};
pub use client::LlmApi;
pub use error::{Error, format_api_error};
pub use types::*;
