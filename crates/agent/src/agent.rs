//! The metrics agent: identity, registration, and bootstrap wired together.

use std::sync::Arc;
use thiserror::Error;

use petrel_core::{MetricsSink, SettingsError, SettingsStore};
use petrel_identity::{
    BootstrapFailure, BootstrapProtocol, BootstrapState, DeviceIdentity, IdentityError,
    InstalledCertificate, KeyStoreError, RegistrationClient, RegistrationError, SecureKeyStore,
    Transport, TrustStore, TrustStoreError,
};

use crate::config::AgentConfig;
use crate::transport::{TransportFactory, TransportFactoryError};

/// Errors that can occur while assembling or running the agent.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportFactoryError),

    #[error("settings store error: {0}")]
    Settings(#[from] SettingsError),

    #[error("keystore error: {0}")]
    KeyStore(#[from] KeyStoreError),

    #[error("trust store error: {0}")]
    TrustStore(#[from] TrustStoreError),

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("registration failed: {0}")]
    Registration(#[from] RegistrationError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapFailure),
}

/// Metrics-reporting agent for an untrusted endpoint device.
///
/// Owns the device identity and the two network clients. Registration and
/// bootstrap failures leave the agent usable; collectors can keep buffering
/// metrics and the caller retries on its own schedule.
pub struct MetricsAgent {
    config: AgentConfig,
    identity: DeviceIdentity,
    registration: RegistrationClient,
    bootstrap: BootstrapProtocol,
}

impl MetricsAgent {
    /// Initialize the agent: open the stores under `data_dir`, load or
    /// create the device identity, and build the HTTP transport from the
    /// configuration.
    pub fn init(config: AgentConfig) -> Result<Self, AgentError> {
        let transport: Arc<dyn Transport> =
            Arc::new(TransportFactory::from_config(&config).build()?);
        Self::assemble(config, transport, None)
    }

    /// Initialize with a metrics sink for diagnostic emission.
    pub fn init_with_metrics(
        config: AgentConfig,
        sink: Arc<dyn MetricsSink>,
    ) -> Result<Self, AgentError> {
        let transport: Arc<dyn Transport> =
            Arc::new(TransportFactory::from_config(&config).build()?);
        Self::assemble(config, transport, Some(sink))
    }

    /// Initialize over an injected transport. Used by tests and by callers
    /// that manage their own TLS stack.
    pub fn init_with_transport(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, AgentError> {
        Self::assemble(config, transport, None)
    }

    fn assemble(
        config: AgentConfig,
        transport: Arc<dyn Transport>,
        metrics: Option<Arc<dyn MetricsSink>>,
    ) -> Result<Self, AgentError> {
        let settings = Arc::new(SettingsStore::open(config.data_dir.join("settings.db"))?);
        let keystore = Arc::new(SecureKeyStore::open(config.data_dir.join("keys"))?);
        let trust_store = Arc::new(TrustStore::open(
            config.data_dir.join("trust"),
            config.expected_certificate_issuer.clone(),
        )?);

        let identity = DeviceIdentity::load_or_create(&settings, &keystore)?;

        let mut registration =
            RegistrationClient::new(transport.clone(), config.backend_base_url.clone())
                .with_timeout(config.request_timeout())
                .with_settings(settings.clone());
        let mut bootstrap = BootstrapProtocol::new(transport, keystore, trust_store)
            .with_timeout(config.request_timeout())
            .with_settings(settings);

        if let Some(sink) = metrics {
            registration = registration.with_metrics(sink.clone());
            bootstrap = bootstrap.with_metrics(sink);
        }

        tracing::info!(uuid = identity.uuid(), "metrics agent initialized");
        Ok(Self {
            config,
            identity,
            registration,
            bootstrap,
        })
    }

    /// The immutable configuration this agent was built with.
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// The device identity presented to the backend and controller.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Register the device identity with the backend. Idempotent.
    pub async fn register(&self) -> Result<(), RegistrationError> {
        self.registration.register(&self.identity).await
    }

    /// Run the certificate bootstrap against the configured bootstrapper.
    ///
    /// The device must have been registered first; the controller verifies
    /// the challenge signature against the public key from registration.
    pub async fn bootstrap(&self) -> Result<InstalledCertificate, BootstrapFailure> {
        self.bootstrap
            .bootstrap_now(
                &self.identity,
                &self.config.bootstrapper_address,
                self.config.controller_port,
            )
            .await
    }

    /// Register, then bootstrap. Bootstrap is not attempted when
    /// registration fails, preserving the required ordering.
    pub async fn start(&self) -> Result<InstalledCertificate, AgentError> {
        self.register().await?;
        Ok(self.bootstrap().await?)
    }

    /// State of the most recent bootstrap attempt.
    pub fn bootstrap_state(&self) -> BootstrapState {
        self.bootstrap.state()
    }
}
