//! # Metrics Collection
//!
//! The storage metrics contract ([`CallMetrics`]) and its implementations:
//! [`MetricsRecorder`] reports through the `metrics` facade (exported to
//! Prometheus by [`init_metrics`]), [`RecordingCallMetrics`] keeps calls in
//! memory for assertions.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use crate::storage::Operation;

/// Status label of a call that returned `Ok`
pub const STATUS_OK: &str = "ok";
/// Status label of a call whose future was dropped before it completed
pub const STATUS_CANCELED: &str = "canceled";

const CALLS_TOTAL: &str = "datastore_calls_total";
const CALL_DURATION: &str = "datastore_call_duration_seconds";

/// Outcome of one storage call
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub operation: Operation,
    pub status: &'static str,
    pub elapsed: Duration,
    pub trust_domain: Option<String>,
}

/// Sink for storage call outcomes.
///
/// Implementations must not block: the call is recorded on the caller's task
/// after the wrapped operation returned.
pub trait CallMetrics: Send + Sync {
    fn record_call(&self, record: CallRecord);
}

/// Metrics recorder reporting through the global `metrics` recorder
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Register descriptions for the storage call metrics
    pub fn register_datastore_metrics(&self) {
        describe_counter!(CALLS_TOTAL, "Total number of datastore calls by operation and status");
        describe_histogram!(CALL_DURATION, Unit::Seconds, "Datastore call latency by operation");
    }
}

impl CallMetrics for MetricsRecorder {
    fn record_call(&self, record: CallRecord) {
        let operation = record.operation.label();
        let mut call_labels =
            vec![("operation", operation.clone()), ("status", record.status.to_string())];
        let mut duration_labels = vec![("operation", operation)];
        if let Some(trust_domain) = record.trust_domain {
            call_labels.push(("trust_domain", trust_domain.clone()));
            duration_labels.push(("trust_domain", trust_domain));
        }

        counter!(CALLS_TOTAL, &call_labels).increment(1);
        histogram!(CALL_DURATION, &duration_labels).record(record.elapsed.as_secs_f64());
    }
}

/// In-memory [`CallMetrics`] that keeps every record
#[derive(Debug, Default)]
pub struct RecordingCallMetrics {
    calls: Mutex<Vec<CallRecord>>,
}

impl RecordingCallMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls recorded so far, in completion order
    pub fn calls(&self) -> Vec<CallRecord> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    /// Number of recorded calls of `operation` that ended with `status`
    pub fn count(&self, operation: Operation, status: &str) -> usize {
        self.calls().iter().filter(|c| c.operation == operation && c.status == status).count()
    }

    pub fn clear(&self) {
        if let Ok(mut calls) = self.calls.lock() {
            calls.clear();
        }
    }
}

impl CallMetrics for RecordingCallMetrics {
    fn record_call(&self, record: CallRecord) {
        match self.calls.lock() {
            Ok(mut calls) => calls.push(record),
            Err(_) => warn!(operation = %record.operation, "Dropped call record: lock poisoned"),
        }
    }
}

/// Install the Prometheus exporter and describe the storage metrics
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    use crate::errors::TrustplaneError;
    use metrics_exporter_prometheus::PrometheusBuilder;
    use std::net::SocketAddr;
    use tracing::info;

    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        TrustplaneError::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| {
            TrustplaneError::config(format!("Failed to initialize metrics exporter: {}", e))
        })?;

    MetricsRecorder::new().register_datastore_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );
    Ok(())
}

/// Without the exporter the metrics are only described; the embedder is
/// expected to install its own recorder.
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if config.enable_metrics {
        warn!("Metrics exporter not compiled in; install a metrics recorder explicitly");
    }
    MetricsRecorder::new().register_datastore_metrics();
    Ok(())
}
