//! Agent configuration.
//!
//! Built once before any component is created, then immutable. The builder
//! derives the bootstrapper address and metrics authority header from the
//! controller address when they are not set explicitly, matching how
//! deployments name those endpoints.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Default per-request timeout in seconds.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Errors raised while building a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration field: {0}")]
    MissingField(&'static str),
}

/// Immutable agent configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Backend base URL for device registration
    pub backend_base_url: String,
    /// Controller host for metrics sessions
    pub controller_address: String,
    /// Port used by the controller and bootstrapper
    pub controller_port: u16,
    /// Bootstrapper host answering the challenge/response exchange
    pub bootstrapper_address: String,
    /// Authority header presented on the metrics channel
    pub metrics_authority_header: String,
    /// Directory holding the settings store, keystore, and trust store
    pub data_dir: PathBuf,
    /// PEM certificate pinned as the sole trust anchor; `None` uses the
    /// system CA roots
    #[serde(default)]
    pub pinned_certificate_pem: Option<String>,
    /// Skip hostname verification, for self-signed bootstrap endpoints
    #[serde(default)]
    pub accept_invalid_hostnames: bool,
    /// Issuer common name the installed controller certificate must carry
    #[serde(default)]
    pub expected_certificate_issuer: Option<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

impl AgentConfig {
    /// Start building a configuration.
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::default()
    }

    /// Load a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// The per-request timeout as a [`Duration`].
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Builder for [`AgentConfig`].
#[derive(Debug, Default)]
pub struct AgentConfigBuilder {
    backend_base_url: Option<String>,
    controller_address: Option<String>,
    controller_port: Option<u16>,
    bootstrapper_address: Option<String>,
    metrics_authority_header: Option<String>,
    data_dir: Option<PathBuf>,
    pinned_certificate_pem: Option<String>,
    accept_invalid_hostnames: bool,
    expected_certificate_issuer: Option<String>,
    request_timeout: Option<Duration>,
}

impl AgentConfigBuilder {
    pub fn backend_base_url(mut self, url: impl Into<String>) -> Self {
        self.backend_base_url = Some(url.into());
        self
    }

    pub fn controller_address(mut self, address: impl Into<String>) -> Self {
        self.controller_address = Some(address.into());
        self
    }

    pub fn controller_port(mut self, port: u16) -> Self {
        self.controller_port = Some(port);
        self
    }

    pub fn bootstrapper_address(mut self, address: impl Into<String>) -> Self {
        self.bootstrapper_address = Some(address.into());
        self
    }

    pub fn metrics_authority_header(mut self, authority: impl Into<String>) -> Self {
        self.metrics_authority_header = Some(authority.into());
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn pinned_certificate_pem(mut self, pem: impl Into<String>) -> Self {
        self.pinned_certificate_pem = Some(pem.into());
        self
    }

    pub fn accept_invalid_hostnames(mut self, accept: bool) -> Self {
        self.accept_invalid_hostnames = accept;
        self
    }

    pub fn expected_certificate_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.expected_certificate_issuer = Some(issuer.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Validate and freeze the configuration.
    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        let backend_base_url = self
            .backend_base_url
            .ok_or(ConfigError::MissingField("backend_base_url"))?;
        let controller_address = self
            .controller_address
            .ok_or(ConfigError::MissingField("controller_address"))?;
        let controller_port = self
            .controller_port
            .ok_or(ConfigError::MissingField("controller_port"))?;
        let data_dir = self.data_dir.ok_or(ConfigError::MissingField("data_dir"))?;

        let bootstrapper_address = self
            .bootstrapper_address
            .unwrap_or_else(|| format!("bootstrapper-{controller_address}"));
        let metrics_authority_header = self
            .metrics_authority_header
            .unwrap_or_else(|| format!("metricsd-{controller_address}"));
        let request_timeout_secs = self
            .request_timeout
            .map(|timeout| timeout.as_secs().max(1))
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);

        Ok(AgentConfig {
            backend_base_url,
            controller_address,
            controller_port,
            bootstrapper_address,
            metrics_authority_header,
            data_dir,
            pinned_certificate_pem: self.pinned_certificate_pem,
            accept_invalid_hostnames: self.accept_invalid_hostnames,
            expected_certificate_issuer: self.expected_certificate_issuer,
            request_timeout_secs,
        })
    }
}
