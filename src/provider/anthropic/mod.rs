//! Native Anthropic Messages API client.
//!
//! Streams `text/event-stream` responses and normalizes them into
//! [`StreamEvent`](crate::provider::StreamEvent)s.

mod client;
mod decoder;
mod request;
mod stream;

pub use client::{AnthropicClient, BASE_URL};
pub use decoder::{EventStream, StreamDecoder, decode_stream};
