//! Core functionality for the Petrel metrics agent.
//!
//! This crate provides the ambient services shared by the rest of the
//! agent: structured logging, the durable settings store used for small
//! key-value state (device UUID, diagnostic timestamps), and the sink
//! interface through which metrics collectors hand off collected records.

pub mod logging;
pub mod metrics;
pub mod settings;

pub use metrics::{LogSink, MetricsSink};
pub use settings::{SettingsError, SettingsStore};
