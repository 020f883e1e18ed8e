//! Shared HTTP plumbing for provider clients.

mod client;
mod sse;

pub use client::{ApiKeyAuth, HttpClient};
pub use sse::SseParser;
