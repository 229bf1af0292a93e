//! Prometheus Metrics Module
//!
//! Exposes pipeline metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Messages**: received, dropped (by reason), and valid counts
//! - **Quality**: anomalies, alerts by severity, data quality score
//! - **Connection**: transport up/down, feed latency
//! - **Cache**: hit rate
//!
//! # Integration
//!
//! Metrics are exposed at `/metrics` on the health server port.

use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if the recorder cannot be installed.
#[allow(clippy::expect_used)]
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            let builder = PrometheusBuilder::new();
            let handle = builder
                .install_recorder()
                .expect("failed to install Prometheus recorder");

            register_metrics();
            handle
        })
        .clone()
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "flow_messages_received_total",
        "Total messages received from the stream transport"
    );
    describe_counter!(
        "flow_messages_dropped_total",
        "Total messages dropped before emission, by reason"
    );
    describe_counter!(
        "flow_messages_valid_total",
        "Total messages that passed the quality gate"
    );
    describe_counter!("flow_anomalies_total", "Total anomalies flagged");
    describe_counter!("flow_alerts_total", "Total alerts raised, by severity");

    describe_gauge!(
        "flow_connection_up",
        "Whether the stream transport is connected (1/0)"
    );
    describe_gauge!(
        "flow_feed_latency_ms",
        "Rolling average source-to-receipt latency in milliseconds"
    );
    describe_gauge!("flow_cache_hit_rate", "Snapshot cache hit rate in [0, 1]");
    describe_gauge!(
        "flow_data_quality_score",
        "Composite data quality score in [0, 100]"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Why a message was dropped.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Structural parse failure.
    Parse,
    /// Rejected by the quality gate.
    Quality,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Quality => "quality",
        }
    }
}

/// Record one message received from the transport.
pub fn record_message_received() {
    counter!("flow_messages_received_total").increment(1);
}

/// Record one dropped message.
pub fn record_message_dropped(reason: DropReason) {
    counter!(
        "flow_messages_dropped_total",
        "reason" => reason.as_str()
    )
    .increment(1);
}

/// Record one message that completed the pipeline.
pub fn record_message_valid() {
    counter!("flow_messages_valid_total").increment(1);
}

/// Record one flagged anomaly.
pub fn record_anomaly() {
    counter!("flow_anomalies_total").increment(1);
}

/// Record one raised alert.
pub fn record_alert(severity: &'static str) {
    counter!(
        "flow_alerts_total",
        "severity" => severity
    )
    .increment(1);
}

/// Update the transport connection gauge.
pub fn set_connection_up(up: bool) {
    gauge!("flow_connection_up").set(if up { 1.0 } else { 0.0 });
}

/// Update the rolling feed latency gauge.
pub fn set_feed_latency(latency_ms: f64) {
    gauge!("flow_feed_latency_ms").set(latency_ms);
}

/// Update the cache hit rate gauge.
pub fn set_cache_hit_rate(rate: f64) {
    gauge!("flow_cache_hit_rate").set(rate);
}

/// Update the data quality score gauge.
pub fn set_data_quality_score(score: f64) {
    gauge!("flow_data_quality_score").set(score);
}

// =============================================================================
// Tests
// =============================================================================
