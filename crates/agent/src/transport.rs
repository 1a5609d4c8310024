//! HTTP/TLS transport construction.
//!
//! The factory produces the one transport object the agent owns, configured
//! either for standard CA trust or for a pinned self-signed trust anchor
//! with an optional hostname-verification override for bootstrap endpoints
//! that present a certificate without a matching name.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

use petrel_identity::{HttpResponse, Transport, TransportError};

use crate::config::AgentConfig;

/// Errors raised while constructing the HTTP client.
#[derive(Debug, Error)]
pub enum TransportFactoryError {
    #[error("invalid pinned certificate: {0}")]
    InvalidPinnedCertificate(String),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),
}

/// Factory for the reqwest-backed [`Transport`] implementation.
#[derive(Debug, Clone, Default)]
pub struct TransportFactory {
    pinned_certificate_pem: Option<String>,
    accept_invalid_hostnames: bool,
    request_timeout: Option<Duration>,
}

impl TransportFactory {
    /// Standard CA trust.
    pub fn standard() -> Self {
        Self::default()
    }

    /// Pin a single PEM certificate as the sole trust anchor.
    pub fn pinned(pem: impl Into<String>) -> Self {
        Self {
            pinned_certificate_pem: Some(pem.into()),
            ..Self::default()
        }
    }

    /// Skip hostname verification (pinned mode only).
    pub fn with_accept_invalid_hostnames(mut self, accept: bool) -> Self {
        self.accept_invalid_hostnames = accept;
        self
    }

    /// Apply an overall per-request timeout at the client level.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Derive factory settings from the agent configuration.
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            pinned_certificate_pem: config.pinned_certificate_pem.clone(),
            accept_invalid_hostnames: config.accept_invalid_hostnames,
            request_timeout: Some(config.request_timeout()),
        }
    }

    /// Build the transport.
    pub fn build(&self) -> Result<HttpTransport, TransportFactoryError> {
        let mut builder = reqwest::Client::builder();

        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(pem) = &self.pinned_certificate_pem {
            let certificate = reqwest::Certificate::from_pem(pem.as_bytes())
                .map_err(|e| TransportFactoryError::InvalidPinnedCertificate(e.to_string()))?;
            builder = builder
                .tls_built_in_root_certs(false)
                .add_root_certificate(certificate);
            if self.accept_invalid_hostnames {
                tracing::warn!("hostname verification disabled for pinned transport");
                builder = builder.danger_accept_invalid_hostnames(true);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportFactoryError::ClientBuild(e.to_string()))?;
        Ok(HttpTransport { client })
    }
}

/// reqwest-backed transport shared by registration and bootstrap.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post_json(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .post(url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError::Network(e.to_string()))?;

        Ok(HttpResponse {
            status,
            body: body.to_vec(),
        })
    }
}
