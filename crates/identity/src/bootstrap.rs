//! Certificate bootstrap against the metrics controller.
//!
//! Drives one challenge/response exchange: request a challenge for the
//! device identity, sign it with the keystore-resident key, send the
//! signature back, validate the returned certificate, and install it into
//! the trust store. The private key handle is the only bridge between
//! challenge and response; raw key material is never touched here.
//!
//! Attempts are single-flight: an async mutex serializes them, and a caller
//! that was blocked behind a successful attempt returns the certificate
//! that attempt installed instead of starting a duplicate exchange. Each
//! network step runs under the configured timeout; expiry is a terminal
//! `Failed(Timeout)` and any challenge the controller already issued is
//! abandoned.

use serde::Deserialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use petrel_core::{MetricsSink, SettingsStore};

use crate::bootstrap_state::{BootstrapFailure, BootstrapState, BootstrapStateMachine, StateError};
use crate::encoding;
use crate::identity::{DeviceIdentity, HW_KEY_ALIAS};
use crate::keystore::SecureKeyStore;
use crate::transport::{HttpResponse, Transport};
use crate::trust_store::{InstalledCertificate, TrustStore};

/// Default timeout applied to each network round-trip.
pub const DEFAULT_BOOTSTRAP_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings key stamped when a bootstrap attempt completes.
pub const BOOTSTRAP_COMPLETED_AT_KEY: &str = "bootstrap_completed_at";

const BOOTSTRAP_METRIC_FAMILY: &str = "agent_bootstrap";

#[derive(Debug, Deserialize)]
struct ChallengeReply {
    #[serde(default)]
    challenge: String,
}

#[derive(Debug, Deserialize)]
struct CertificateReply {
    #[serde(default)]
    certificate: String,
}

/// Executes the bootstrap exchange and tracks its state machine.
pub struct BootstrapProtocol {
    transport: Arc<dyn Transport>,
    keystore: Arc<SecureKeyStore>,
    trust_store: Arc<TrustStore>,
    settings: Option<Arc<SettingsStore>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    timeout: Duration,
    attempt: tokio::sync::Mutex<()>,
    machine: Mutex<BootstrapStateMachine>,
}

impl BootstrapProtocol {
    /// Create a protocol instance over the given collaborators.
    pub fn new(
        transport: Arc<dyn Transport>,
        keystore: Arc<SecureKeyStore>,
        trust_store: Arc<TrustStore>,
    ) -> Self {
        Self {
            transport,
            keystore,
            trust_store,
            settings: None,
            metrics: None,
            timeout: DEFAULT_BOOTSTRAP_TIMEOUT,
            attempt: tokio::sync::Mutex::new(()),
            machine: Mutex::new(BootstrapStateMachine::new()),
        }
    }

    /// Configure the per-step timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Record `bootstrap_completed_at` into this settings store on success.
    pub fn with_settings(mut self, settings: Arc<SettingsStore>) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Emit diagnostic metrics through this sink.
    pub fn with_metrics(mut self, sink: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(sink);
        self
    }

    /// State of the most recent attempt.
    pub fn state(&self) -> BootstrapState {
        self.machine
            .lock()
            .expect("bootstrap state lock poisoned")
            .current_state()
            .clone()
    }

    /// Transition history of the most recent attempt, oldest first.
    pub fn history(&self) -> Vec<crate::bootstrap_state::StateTransition> {
        self.machine
            .lock()
            .expect("bootstrap state lock poisoned")
            .history()
            .iter()
            .cloned()
            .collect()
    }

    /// Run the full bootstrap exchange against
    /// `https://{controller_address}:{controller_port}`.
    ///
    /// Returns the installed certificate, or the terminal failure reason.
    /// No retry happens here; callers own the retry schedule. The device
    /// must already be registered with the backend, since the controller
    /// verifies the signature against the public key on file.
    pub async fn bootstrap_now(
        &self,
        identity: &DeviceIdentity,
        controller_address: &str,
        controller_port: u16,
    ) -> Result<InstalledCertificate, BootstrapFailure> {
        let _in_flight = self.attempt.lock().await;

        if matches!(self.state(), BootstrapState::Installed { .. }) {
            if let Ok(Some(installed)) = self.trust_store.installed() {
                tracing::debug!("joining completed bootstrap attempt");
                return Ok(installed);
            }
        }

        let started = Instant::now();
        let mut machine = BootstrapStateMachine::new();
        let result = self
            .run_exchange(identity, controller_address, controller_port, &mut machine)
            .await;

        match &result {
            Ok(installed) => {
                self.stamp_completed();
                self.emit("installed", started.elapsed());
                tracing::info!(
                    uuid = identity.uuid(),
                    serial = %installed.serial,
                    "controller certificate installed"
                );
            }
            Err(reason) => {
                if let Err(err) = machine.fail(reason.clone()) {
                    tracing::warn!(error = %err, "failure after terminal bootstrap state");
                }
                self.emit(failure_label(reason), started.elapsed());
                tracing::warn!(uuid = identity.uuid(), error = %reason, "bootstrap attempt failed");
            }
        }

        *self.machine.lock().expect("bootstrap state lock poisoned") = machine;
        result
    }

    async fn run_exchange(
        &self,
        identity: &DeviceIdentity,
        controller_address: &str,
        controller_port: u16,
        machine: &mut BootstrapStateMachine,
    ) -> Result<InstalledCertificate, BootstrapFailure> {
        let base = format!(
            "https://{}:{}",
            controller_address.trim_end_matches('/'),
            controller_port
        );

        machine.on_challenge_requested().map_err(state_bug)?;
        let challenge_body = serde_json::json!({
            "uuid": identity.uuid(),
            "public_key": identity.public_key(),
        });
        let response = self
            .post(&format!("{base}/bootstrap/challenge"), challenge_body)
            .await?;
        if !response.is_success() {
            return Err(BootstrapFailure::ProtocolError(format!(
                "challenge request returned status {}",
                response.status
            )));
        }
        let reply: ChallengeReply = response
            .json()
            .map_err(|e| BootstrapFailure::ProtocolError(e.to_string()))?;
        if reply.challenge.is_empty() {
            return Err(BootstrapFailure::ProtocolError(
                "controller returned an empty challenge".to_string(),
            ));
        }
        machine
            .on_challenge_received(digest(reply.challenge.as_bytes()))
            .map_err(state_bug)?;

        let signature = self
            .keystore
            .sign(HW_KEY_ALIAS, reply.challenge.as_bytes())
            .map_err(|e| BootstrapFailure::SigningError(e.to_string()))?;
        machine.on_response_sent(digest(&signature)).map_err(state_bug)?;

        let respond_body = serde_json::json!({
            "uuid": identity.uuid(),
            "signature": encoding::to_base64(&signature),
        });
        let response = self
            .post(&format!("{base}/bootstrap/respond"), respond_body)
            .await?;
        if !response.is_success() {
            return Err(BootstrapFailure::Rejected(format!(
                "controller answered the signed response with status {}",
                response.status
            )));
        }
        let reply: CertificateReply = response
            .json()
            .map_err(|e| BootstrapFailure::ProtocolError(e.to_string()))?;
        if reply.certificate.is_empty() {
            return Err(BootstrapFailure::ProtocolError(
                "controller returned an empty certificate".to_string(),
            ));
        }
        let der = encoding::from_base64(&reply.certificate).map_err(|_| {
            BootstrapFailure::InvalidCertificate("certificate is not valid base64".to_string())
        })?;
        machine
            .on_certificate_received(digest(&der))
            .map_err(state_bug)?;

        let installed = self
            .trust_store
            .install(&der)
            .map_err(|e| BootstrapFailure::InvalidCertificate(e.to_string()))?;
        machine
            .on_installed(installed.serial.clone())
            .map_err(state_bug)?;

        Ok(installed)
    }

    async fn post(
        &self,
        url: &str,
        body: serde_json::Value,
    ) -> Result<HttpResponse, BootstrapFailure> {
        match tokio::time::timeout(self.timeout, self.transport.post_json(url, body)).await {
            Err(_) => Err(BootstrapFailure::Timeout(self.timeout.as_millis() as u64)),
            Ok(Err(err)) => Err(BootstrapFailure::NetworkError(err.to_string())),
            Ok(Ok(response)) => Ok(response),
        }
    }

    fn stamp_completed(&self) {
        let Some(settings) = &self.settings else {
            return;
        };
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        if let Err(err) = settings.set(BOOTSTRAP_COMPLETED_AT_KEY, &now_ms.to_string()) {
            tracing::warn!(error = %err, "failed to record bootstrap_completed_at");
        }
    }

    fn emit(&self, result: &str, elapsed: Duration) {
        if let Some(sink) = &self.metrics {
            sink.on_metric_collected(
                BOOTSTRAP_METRIC_FAMILY,
                &[
                    ("result".to_string(), result.to_string()),
                    (
                        "duration_millis".to_string(),
                        elapsed.as_millis().to_string(),
                    ),
                ],
            );
        }
    }
}

fn digest(bytes: &[u8]) -> Vec<u8> {
    blake3::hash(bytes).as_bytes().to_vec()
}

fn state_bug(err: StateError) -> BootstrapFailure {
    BootstrapFailure::ProtocolError(format!("bootstrap state machine: {err}"))
}

fn failure_label(reason: &BootstrapFailure) -> &'static str {
    match reason {
        BootstrapFailure::NetworkError(_) => "network_error",
        BootstrapFailure::ProtocolError(_) => "protocol_error",
        BootstrapFailure::SigningError(_) => "signing_error",
        BootstrapFailure::Rejected(_) => "rejected",
        BootstrapFailure::InvalidCertificate(_) => "invalid_certificate",
        BootstrapFailure::Timeout(_) => "timeout",
    }
}
