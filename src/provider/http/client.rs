//! HTTP client wrapper for streaming LLM API requests.

use crate::provider::error::Error;
use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;
use std::time::Duration;

/// Connection timeout. There is no overall timeout: streams stay open for
/// as long as the model keeps generating.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Custom header authentication (e.g., x-api-key: {key}).
#[derive(Clone)]
pub struct ApiKeyAuth {
    pub header: String,
    pub key: String,
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("header", &self.header)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// HTTP client for LLM API requests.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    base_url: String,
    auth: ApiKeyAuth,
}

impl HttpClient {
    #[cfg(test)]
    pub fn new(base_url: impl Into<String>, auth: ApiKeyAuth) -> Self {
        Self::with_default_headers(base_url, auth, HeaderMap::new())
    }

    /// Create a client that sends `extra` on every request.
    pub fn with_default_headers(
        base_url: impl Into<String>,
        auth: ApiKeyAuth,
        extra: HeaderMap,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .default_headers(extra)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            auth,
        }
    }

    /// Build headers including authentication.
    pub(crate) fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let name = HeaderName::try_from(self.auth.header.as_str())
            .map_err(|_| Error::Api("API key header name is invalid".into()))?;
        let value = HeaderValue::from_str(&self.auth.key)
            .map_err(|_| Error::Api("API key contains invalid header characters".into()))?;
        headers.insert(name, value);

        Ok(headers)
    }

    /// Make a POST request for a streaming response.
    ///
    /// Sets `Accept: text/event-stream`. A non-success status or a body that
    /// ends before its first byte fails with [`Error::Provider`] before any
    /// bytes are handed out.
    pub async fn post_stream<T: Serialize>(
        &self,
        path: &str,
        body: &T,
        extra: HeaderMap,
    ) -> Result<impl Stream<Item = Result<Bytes, reqwest::Error>> + use<T>, Error> {
        let url = format!("{}{path}", self.base_url);
        let mut headers = self.build_headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        headers.extend(extra);

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Provider {
                status: status.as_u16(),
                body: text,
            });
        }

        // Chunked and HTTP/2 bodies carry no length; wait for the first byte.
        let mut bytes = Box::pin(response.bytes_stream());
        let first = loop {
            match bytes.next().await {
                Some(Ok(chunk)) if chunk.is_empty() => {}
                Some(Ok(chunk)) => break chunk,
                Some(Err(e)) => return Err(e.into()),
                None => {
                    return Err(Error::Provider {
                        status: status.as_u16(),
                        body: "No response body".to_string(),
                    });
                }
            }
        };

        Ok(stream::once(futures::future::ready(Ok(first))).chain(bytes))
    }
}
