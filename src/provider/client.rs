//! Provider-facing client trait.

use super::anthropic::EventStream;
use super::error::Error;
use super::types::Message;
use async_trait::async_trait;

/// A provider that can stream a response for a conversation.
#[async_trait]
pub trait LlmApi: Send + Sync {
    /// Provider identifier (e.g., "anthropic").
    fn id(&self) -> &str;

    /// Open one streaming request.
    ///
    /// `model` is resolved against the static registry; `None` or an unknown id
    /// selects the default model. Non-success responses fail here, before the
    /// stream yields anything.
    async fn send(
        &self,
        system_prompt: &str,
        history: &[Message],
        model: Option<&str>,
    ) -> Result<EventStream, Error>;
}
