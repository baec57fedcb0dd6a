//! Upstream transport seam
//!
//! The executor talks to the generate endpoint through `GenerateTransport`
//! so tests can script responses without a network. The production
//! implementation wraps a shared `reqwest::Client`; the executor owns the
//! per-attempt deadline, so the transport only reports what the wire did.

use async_trait::async_trait;
use tracing::debug;

/// Fixed upstream endpoint for generate-content calls.
pub const GENERATE_ENDPOINT: &str =
    "https://cloudcode-pa.googleapis.com/v1internal:generateContent";

/// Status and body of an upstream response, before classification.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Transport-level failures (the request never produced a response).
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),
}

/// One POST to the generate endpoint with a bearer token.
#[async_trait]
pub trait GenerateTransport: Send + Sync {
    async fn post_generate(
        &self,
        body: &serde_json::Value,
        access_token: &str,
    ) -> Result<RawResponse, TransportError>;
}

/// Production transport over a shared `reqwest::Client`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self::with_endpoint(client, GENERATE_ENDPOINT)
    }

    /// Point at a different endpoint (staging, local fixtures).
    pub fn with_endpoint(client: reqwest::Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl GenerateTransport for HttpTransport {
    async fn post_generate(
        &self,
        body: &serde_json::Value,
        access_token: &str,
    ) -> Result<RawResponse, TransportError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(access_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::Timeout
                } else {
                    TransportError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Network(format!("reading response body: {e}")))?;
        debug!(status, bytes = body.len(), "upstream responded");
        Ok(RawResponse { status, body })
    }
}
