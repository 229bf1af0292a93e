//! Event Bus
//!
//! Fan-out of pipeline output to downstream consumers using tokio broadcast
//! channels, one per event type.
//!
//! # Ordering
//!
//! Delivery order is guaranteed within a single channel only, never across
//! channels. A lagging receiver loses its oldest backlog without affecting
//! any other receiver, so one slow or failing listener can never stall the
//! pipeline or its peers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::domain::snapshot::Snapshot;

// =============================================================================
// Event payloads
// =============================================================================

/// A clean, validated snapshot leaving the pipeline.
#[derive(Debug, Clone)]
pub struct DataEvent {
    /// The validated snapshot.
    pub snapshot: Snapshot,
}

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Informational only.
    Info,
    /// Needs attention.
    Warning,
    /// Something was dropped or failed.
    Error,
}

impl AlertSeverity {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// Category of a pipeline alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Transport connection state change or failure.
    Connection,
    /// Feed latency threshold breached.
    Latency,
    /// Quality gate rejected or flagged a snapshot.
    Quality,
    /// Anomaly detector flagged a snapshot.
    Anomaly,
    /// Upstream feed reported an error.
    Feed,
}

/// One pipeline alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: Uuid,
    /// Alert category.
    pub kind: AlertKind,
    /// Severity.
    pub severity: AlertSeverity,
    /// Human-readable message.
    pub message: String,
    /// When the alert was raised.
    pub timestamp: DateTime<Utc>,
    /// Optional structured payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl Alert {
    /// Create an alert stamped with a fresh id and the current time.
    #[must_use]
    pub fn new(kind: AlertKind, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            message: message.into(),
            timestamp: Utc::now(),
            data: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// Periodic pipeline health metrics.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    /// Cache hit rate in `[0, 1]`.
    pub cache_hit_rate: f64,
    /// Rolling average feed latency in milliseconds.
    pub avg_latency_ms: f64,
    /// Composite data quality score in `[0, 100]`.
    pub data_quality_score: f64,
    /// Messages that passed the quality gate.
    pub valid_messages: u64,
    /// Messages rejected by the quality gate.
    pub invalid_messages: u64,
    /// Anomalies flagged.
    pub anomalies: u64,
    /// When the metrics were computed.
    pub timestamp: DateTime<Utc>,
}

/// Transport lifecycle event for downstream consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The transport connection came up.
    Connected,
    /// The transport connection went down.
    Disconnected,
}

/// A non-market feed message re-emitted without pipeline processing.
#[derive(Debug, Clone)]
pub struct PassthroughEvent {
    /// Raw message payload.
    pub payload: serde_json::Value,
}

// =============================================================================
// Bus
// =============================================================================

/// Channel capacities for the event bus.
#[derive(Debug, Clone, Copy)]
pub struct EventBusConfig {
    /// Capacity of the data channel.
    pub data_capacity: usize,
    /// Capacity of the alert channel.
    pub alerts_capacity: usize,
    /// Capacity of the metrics channel.
    pub metrics_capacity: usize,
    /// Capacity of the connection channel.
    pub connection_capacity: usize,
    /// Capacity of the passthrough channel.
    pub passthrough_capacity: usize,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            data_capacity: 4_096,
            alerts_capacity: 256,
            metrics_capacity: 64,
            connection_capacity: 16,
            passthrough_capacity: 256,
        }
    }
}

/// Central hub for all outbound event channels.
#[derive(Debug)]
pub struct EventBus {
    data_tx: broadcast::Sender<DataEvent>,
    alerts_tx: broadcast::Sender<Alert>,
    metrics_tx: broadcast::Sender<PipelineMetrics>,
    connection_tx: broadcast::Sender<ConnectionEvent>,
    passthrough_tx: broadcast::Sender<PassthroughEvent>,
}

impl EventBus {
    /// Create a bus with the given channel capacities.
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            data_tx: broadcast::channel(config.data_capacity).0,
            alerts_tx: broadcast::channel(config.alerts_capacity).0,
            metrics_tx: broadcast::channel(config.metrics_capacity).0,
            connection_tx: broadcast::channel(config.connection_capacity).0,
            passthrough_tx: broadcast::channel(config.passthrough_capacity).0,
        }
    }

    /// Create a bus with default capacities.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(EventBusConfig::default())
    }

    /// Emit a data event. Returns the receiver count, `None` with none.
    #[must_use]
    pub fn send_data(&self, event: DataEvent) -> Option<usize> {
        self.data_tx.send(event).ok()
    }

    /// Get a new receiver for data events.
    #[must_use]
    pub fn data_rx(&self) -> broadcast::Receiver<DataEvent> {
        self.data_tx.subscribe()
    }

    /// Emit an alert.
    #[must_use]
    pub fn send_alert(&self, alert: Alert) -> Option<usize> {
        self.alerts_tx.send(alert).ok()
    }

    /// Get a new receiver for alerts.
    #[must_use]
    pub fn alerts_rx(&self) -> broadcast::Receiver<Alert> {
        self.alerts_tx.subscribe()
    }

    /// Emit a metrics tick.
    #[must_use]
    pub fn send_metrics(&self, metrics: PipelineMetrics) -> Option<usize> {
        self.metrics_tx.send(metrics).ok()
    }

    /// Get a new receiver for metrics ticks.
    #[must_use]
    pub fn metrics_rx(&self) -> broadcast::Receiver<PipelineMetrics> {
        self.metrics_tx.subscribe()
    }

    /// Emit a connection lifecycle event.
    #[must_use]
    pub fn send_connection(&self, event: ConnectionEvent) -> Option<usize> {
        self.connection_tx.send(event).ok()
    }

    /// Get a new receiver for connection events.
    #[must_use]
    pub fn connection_rx(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connection_tx.subscribe()
    }

    /// Re-emit a non-market feed message.
    #[must_use]
    pub fn send_passthrough(&self, event: PassthroughEvent) -> Option<usize> {
        self.passthrough_tx.send(event).ok()
    }

    /// Get a new receiver for passthrough messages.
    #[must_use]
    pub fn passthrough_rx(&self) -> broadcast::Receiver<PassthroughEvent> {
        self.passthrough_tx.subscribe()
    }

    /// Receiver counts across all channels.
    #[must_use]
    pub fn stats(&self) -> EventBusStats {
        EventBusStats {
            data_receivers: self.data_tx.receiver_count(),
            alert_receivers: self.alerts_tx.receiver_count(),
            metrics_receivers: self.metrics_tx.receiver_count(),
            connection_receivers: self.connection_tx.receiver_count(),
            passthrough_receivers: self.passthrough_tx.receiver_count(),
        }
    }
}

/// Shared event bus reference.
pub type SharedEventBus = Arc<EventBus>;

/// Receiver counts per channel.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EventBusStats {
    /// Data channel receivers.
    pub data_receivers: usize,
    /// Alert channel receivers.
    pub alert_receivers: usize,
    /// Metrics channel receivers.
    pub metrics_receivers: usize,
    /// Connection channel receivers.
    pub connection_receivers: usize,
    /// Passthrough channel receivers.
    pub passthrough_receivers: usize,
}

impl EventBusStats {
    /// Total receivers across all channels.
    #[must_use]
    pub const fn total_receivers(&self) -> usize {
        self.data_receivers
            + self.alert_receivers
            + self.metrics_receivers
            + self.connection_receivers
            + self.passthrough_receivers
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::domain::snapshot::Snapshot;

    use super::*;

    fn make_data_event() -> DataEvent {
        DataEvent {
            snapshot: Snapshot::new("AAPL".to_string(), Utc::now()),
        }
    }

    #[test]
    fn bus_starts_with_no_receivers() {
        let bus = EventBus::with_defaults();
        assert_eq!(bus.stats().total_receivers(), 0);
    }

    #[test]
    fn send_with_no_receivers_returns_none() {
        let bus = EventBus::with_defaults();
        assert!(bus.send_data(make_data_event()).is_none());
    }

    #[tokio::test]
    async fn data_events_reach_all_receivers() {
        let bus = EventBus::with_defaults();
        let mut rx1 = bus.data_rx();
        let mut rx2 = bus.data_rx();

        assert_eq!(bus.send_data(make_data_event()), Some(2));

        assert_eq!(rx1.recv().await.unwrap().snapshot.symbol, "AAPL");
        assert_eq!(rx2.recv().await.unwrap().snapshot.symbol, "AAPL");
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let bus = EventBus::with_defaults();
        let mut alerts = bus.alerts_rx();
        let _data = bus.data_rx();

        let _ = bus.send_alert(Alert::new(
            AlertKind::Quality,
            AlertSeverity::Warning,
            "close outside range",
        ));
        let _ = bus.send_data(make_data_event());

        let alert = alerts.recv().await.unwrap();
        assert_eq!(alert.severity, AlertSeverity::Warning);
        // No alert backlog besides the one sent.
        assert!(alerts.try_recv().is_err());
    }

    #[tokio::test]
    async fn lagging_receiver_does_not_affect_others() {
        let bus = EventBus::new(EventBusConfig {
            data_capacity: 2,
            ..EventBusConfig::default()
        });
        let mut laggard = bus.data_rx();
        let mut keeper = bus.data_rx();

        for _ in 0..5 {
            let _ = bus.send_data(make_data_event());
            // Keeper stays caught up while the laggard never reads.
            assert!(keeper.recv().await.is_ok());
        }

        // Laggard observes the lag, then keeps receiving.
        assert!(matches!(
            laggard.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(laggard.recv().await.is_ok());
    }

    #[test]
    fn receiver_count_drops_with_receiver() {
        let bus = EventBus::with_defaults();
        {
            let _rx = bus.metrics_rx();
            assert_eq!(bus.stats().metrics_receivers, 1);
        }
        assert_eq!(bus.stats().metrics_receivers, 0);
    }

    #[test]
    fn alert_serializes_with_severity_label() {
        let alert = Alert::new(AlertKind::Latency, AlertSeverity::Error, "too slow")
            .with_data(serde_json::json!({"latency_ms": 6_000}));
        let json = serde_json::to_value(&alert).unwrap();
        assert_eq!(json["severity"], "error");
        assert_eq!(json["kind"], "latency");
        assert_eq!(json["data"]["latency_ms"], 6_000);
    }
}
