//! Petrel metrics agent assembly.
//!
//! Wires the identity core to a concrete HTTP/TLS transport and a durable
//! data directory. The agent is configured once through an immutable
//! [`AgentConfig`] (builder or TOML file), initialized with
//! [`MetricsAgent::init`], and then registered and bootstrapped:
//!
//! ```no_run
//! use petrel_agent::{AgentConfig, MetricsAgent};
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AgentConfig::builder()
//!     .backend_base_url("https://backend.example")
//!     .controller_address("controller.example")
//!     .controller_port(443)
//!     .data_dir("/var/lib/petrel")
//!     .build()?;
//!
//! let agent = MetricsAgent::init(config)?;
//! agent.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod transport;

pub use agent::{AgentError, MetricsAgent};
pub use config::{AgentConfig, AgentConfigBuilder, ConfigError};
pub use transport::{HttpTransport, TransportFactory, TransportFactoryError};
