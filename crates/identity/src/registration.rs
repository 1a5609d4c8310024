//! Device registration with the backend.
//!
//! One idempotent POST of `{uuid, public_key}`. The backend treats
//! re-registration of a known UUID as a refresh, so calling this on every
//! agent start is safe. Retry policy belongs to the caller; this client
//! makes exactly one attempt per call.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

use petrel_core::{MetricsSink, SettingsStore};

use crate::identity::DeviceIdentity;
use crate::transport::Transport;

/// Settings key stamped with the time of the last successful registration.
pub const LAST_REGISTERED_AT_KEY: &str = "last_registered_at";

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const REGISTRATION_METRIC_FAMILY: &str = "agent_registration";

/// Errors that can occur during registration.
#[derive(Debug, Error)]
pub enum RegistrationError {
    /// DNS, connect, TLS, or request failure.
    #[error("network error during registration: {0}")]
    Network(String),

    /// The backend answered with a non-2xx status.
    #[error("backend rejected registration with status {status}")]
    Rejected { status: u16 },

    /// The configured timeout elapsed before the backend answered.
    #[error("registration timed out after {0:?}")]
    Timeout(Duration),
}

/// Client for the backend registration endpoint.
pub struct RegistrationClient {
    transport: Arc<dyn Transport>,
    base_url: String,
    timeout: Duration,
    settings: Option<Arc<SettingsStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
}

impl RegistrationClient {
    /// Create a client against `base_url` (e.g. `https://backend.example`).
    pub fn new(transport: Arc<dyn Transport>, base_url: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            settings: None,
            metrics: None,
        }
    }

    /// Configure the per-request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record `last_registered_at` into this settings store on success.
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Emit diagnostic metrics through this sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// Register `identity` with the backend.
    ///
    /// Safe to call repeatedly with the same identity. On failure the error
    /// is returned for the caller to schedule a retry; no retry happens
    /// here.
    pub async fn register(&self, identity: &DeviceIdentity) -> Result<(), RegistrationError> {
        let url = format!("{}/register", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "uuid": identity.uuid(),
            "public_key": identity.public_key(),
        });

        tracing::debug!(uuid = identity.uuid(), %url, "registering device identity");

        let response = match tokio::time::timeout(self.timeout, self.transport.post_json(&url, body))
            .await
        {
            Err(_) => {
                self.emit("timeout");
                return Err(RegistrationError::Timeout(self.timeout));
            }
            Ok(Err(err)) => {
                self.emit("network_error");
                return Err(RegistrationError::Network(err.to_string()));
            }
            Ok(Ok(response)) => response,
        };

        if !response.is_success() {
            self.emit("rejected");
            return Err(RegistrationError::Rejected {
                status: response.status,
            });
        }

        self.stamp_last_registered();
        self.emit("ok");
        tracing::info!(uuid = identity.uuid(), "device registered with backend");
        Ok(())
    }

    fn stamp_last_registered(&self) {
        let Some(settings) = &self.settings else {
            return;
        };
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        if let Err(err) = settings.set(LAST_REGISTERED_AT_KEY, &now_ms.to_string()) {
            tracing::warn!(error = %err, "failed to record last_registered_at");
        }
    }

    fn emit(&self, result: &str) {
        if let Some(sink) = &self.metrics {
            sink.on_metric_collected(
                REGISTRATION_METRIC_FAMILY,
                &[("result".to_string(), result.to_string())],
            );
        }
    }
}
