//! Metrics emission interface.
//!
//! Collectors (Wi-Fi sessions, network usage, the bootstrap/registration
//! components themselves) hand completed records to a [`MetricsSink`] as a
//! metric family name plus an ordered list of key/value fields. What
//! happens next (batching, upload, plain logging) is the sink's concern.
//! The identity core never depends on a concrete sink.

use std::fmt;

/// Receiver for asynchronously collected metric records.
///
/// Implementations must be cheap and non-blocking from the caller's view;
/// a collection cycle finishing must never stall on delivery.
pub trait MetricsSink: Send + Sync {
    /// Called whenever a metrics source completes a collection cycle.
    ///
    /// `family` names the metric family; `fields` is the ordered list of
    /// key/value pairs collected for it.
    fn on_metric_collected(&self, family: &str, fields: &[(String, String)]);
}

/// Sink that forwards every record to the tracing subscriber.
///
/// Useful as a development default and in tests that only need delivery
/// to be observable.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn on_metric_collected(&self, family: &str, fields: &[(String, String)]) {
        tracing::info!(family = %family, fields = %FieldList(fields), "metric collected");
    }
}

struct FieldList<'a>(&'a [(String, String)]);

impl fmt::Display for FieldList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        Ok(())
    }
}
