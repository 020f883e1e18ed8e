//! Provider error types.

use thiserror::Error;

/// Format an API error for display, extracting message from JSON if present.
///
/// Handles common patterns:
/// - `"HTTP 403: {"error": {"message": "..."}}"` → extracts message
/// - `"HTTP 529: {"type":"error","error":{"type":"overloaded_error",...}}"` → extracts message
/// - Plain text errors → returns as-is
#[must_use]
pub fn format_api_error(error: &str) -> String {
    // Try to find JSON in the error message (after "HTTP XXX: " prefix)
    if let Some(json_start) = error.find('{') {
        let json_str = &error[json_start..];

        if let Ok(json) = serde_json::from_str::<serde_json::Value>(json_str)
            && let Some(msg) = extract_error_message(&json)
        {
            let prefix = &error[..json_start].trim();
            if prefix.is_empty() {
                return msg;
            }
            return format!("{prefix} {msg}");
        }
    }

    error.to_string()
}

/// Extract user-friendly message from JSON error response.
fn extract_error_message(json: &serde_json::Value) -> Option<String> {
    // {"type":"error","error":{"type":"...","message":"..."}}
    // {"error": "..."}
    // {"message": "..."}
    if let Some(error_obj) = json.get("error") {
        if let Some(msg) = error_obj.get("message").and_then(|v| v.as_str()) {
            if let Some(kind) = error_obj.get("type").and_then(|v| v.as_str()) {
                return Some(format!("{msg} ({kind})"));
            }
            return Some(msg.to_string());
        }

        if let Some(msg) = error_obj.as_str() {
            return Some(msg.to_string());
        }
    }

    if let Some(msg) = json.get("message").and_then(|v| v.as_str()) {
        return Some(msg.to_string());
    }

    None
}

#[derive(Debug, Error)]
pub enum Error {
    /// Non-success HTTP response, or a response without a body.
    #[error("HTTP {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("API error: {0}")]
    Api(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Cancelled")]
    Cancelled,
}

impl Error {
    /// Message suitable for showing to the user.
    #[must_use]
    pub fn display_message(&self) -> String {
        format_api_error(&self.to_string())
    }
}
