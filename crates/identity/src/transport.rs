//! Transport seam between the identity core and the HTTP/TLS stack.
//!
//! Registration and bootstrap only need "POST this JSON, give me status and
//! body". The production implementation lives in the agent crate and wraps
//! reqwest; tests substitute scripted in-memory transports.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Errors produced by a transport implementation.
#[derive(Debug, Error)]
pub enum TransportError {
    /// DNS, connect, TLS, or request failure.
    #[error("network error: {0}")]
    Network(String),

    /// The response body could not be decoded as the expected shape.
    #[error("malformed response body: {0}")]
    MalformedBody(String),
}

/// Status and raw body of an HTTP exchange.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Whether the status is 2xx.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, TransportError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| TransportError::MalformedBody(e.to_string()))
    }
}

/// HTTP(S) transport used by [`crate::RegistrationClient`] and
/// [`crate::BootstrapProtocol`]. TLS configuration (standard CA trust or a
/// pinned anchor) is the implementation's concern.
#[async_trait]
pub trait Transport: Send + Sync {
    /// POST `body` as JSON to `url` and return the response.
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse, TransportError>;
}
