//! Flow Orchestrator
//!
//! Binds one transport connection to the stream pipeline: parse, latency
//! tracking, quality gate, anomaly detection, caching, and event emission.
//!
//! # Pipeline
//!
//! Messages for one connection are processed strictly in arrival order by a
//! single task, so the per-symbol history and multi-source buffers need no
//! locking discipline beyond their own interior mutability:
//!
//! 1. Timestamp receipt and account throughput.
//! 2. Dispatch by message kind; non-market kinds are re-emitted directly.
//! 3. Parse into a canonical [`Snapshot`]; structural failures are dropped
//!    and counted.
//! 4. Record feed latency; threshold breaches raise an alert but never stop
//!    the pipeline.
//! 5. Quality gate: errors drop the message with an error alert, warnings
//!    pass through with a warning alert.
//! 6. Anomaly detection: the message is retained either way.
//! 7. Append to the per-symbol baseline and the multi-source buffer.
//! 8. Cache under `market:<symbol>` with a short TTL.
//! 9. Emit a `data` event.
//!
//! # Lifecycle
//!
//! `DISCONNECTED → CONNECTING → CONNECTED → DISCONNECTED → …` mirroring the
//! transport, with a one-way terminal `DESTROYED` reached only through
//! [`FlowOrchestrator::destroy`]. Destroy is idempotent, safe before the
//! first connect, and deterministically stops the metrics tick.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::application::ports::{ControlMessage, Transport, TransportEvent};
use crate::domain::snapshot::{Snapshot, SourceId, Symbol};
use crate::domain::validation::{CrossSourceReport, SnapshotValidator};
use crate::infrastructure::cache::FlowCache;
use crate::infrastructure::connection::{ConnectionTracker, FeedLatencyMonitor, LatencyLevel};
use crate::infrastructure::events::{
    Alert, AlertKind, AlertSeverity, ConnectionEvent, DataEvent, PassthroughEvent,
    PipelineMetrics, SharedEventBus,
};
use crate::infrastructure::feed::codec::JsonCodec;
use crate::infrastructure::feed::messages::FeedMessage;
use crate::infrastructure::metrics as flow_metrics;

/// Source id assigned to records the stream delivers without one.
const STREAM_SOURCE: &str = "stream";

// =============================================================================
// State and configuration
// =============================================================================

/// Connection state of the orchestrated transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// No connection.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// The stream is live.
    Connected,
    /// Terminal; reached only via `destroy()`.
    Destroyed,
}

impl ConnectionState {
    /// Label used in logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Ring-buffer capacity of the alert log.
    pub alert_capacity: usize,
    /// Interval of the metrics tick while connected.
    pub metrics_interval: Duration,
    /// TTL for cached stream snapshots.
    pub snapshot_ttl: Duration,
    /// Sources retained per symbol in the multi-source buffer.
    pub multi_source_cap: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            alert_capacity: 100,
            metrics_interval: Duration::from_secs(1),
            snapshot_ttl: Duration::from_secs(60),
            multi_source_cap: 3,
        }
    }
}

/// Lifetime message counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PipelineCounters {
    /// Messages received on the transport.
    pub received: u64,
    /// Messages dropped at the parse boundary.
    pub parse_failures: u64,
    /// Messages rejected by the quality gate.
    pub invalid: u64,
    /// Messages that completed the pipeline.
    pub valid: u64,
    /// Anomalies flagged.
    pub anomalies: u64,
    /// Non-market messages re-emitted directly.
    pub passthrough: u64,
}

#[derive(Debug, Default)]
struct AtomicCounters {
    received: AtomicU64,
    parse_failures: AtomicU64,
    invalid: AtomicU64,
    valid: AtomicU64,
    anomalies: AtomicU64,
    passthrough: AtomicU64,
}

impl AtomicCounters {
    fn snapshot(&self) -> PipelineCounters {
        PipelineCounters {
            received: self.received.load(Ordering::Relaxed),
            parse_failures: self.parse_failures.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
            anomalies: self.anomalies.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
        }
    }
}

/// Shared pipeline collaborators, constructed at composition time and
/// injected — no process-wide singletons.
pub struct PipelineComponents {
    /// Snapshot cache.
    pub cache: Arc<FlowCache<Snapshot>>,
    /// Quality and anomaly validator.
    pub validator: Arc<SnapshotValidator>,
    /// Transport connection health tracker.
    pub tracker: Arc<ConnectionTracker>,
    /// Feed latency monitor.
    pub latency: Arc<FeedLatencyMonitor>,
    /// Outbound event bus.
    pub bus: SharedEventBus,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Orchestrates one transport connection through the stream pipeline.
pub struct FlowOrchestrator {
    config: OrchestratorConfig,
    transport: Arc<dyn Transport>,
    cache: Arc<FlowCache<Snapshot>>,
    validator: Arc<SnapshotValidator>,
    tracker: Arc<ConnectionTracker>,
    latency: Arc<FeedLatencyMonitor>,
    bus: SharedEventBus,
    codec: JsonCodec,
    state: Mutex<ConnectionState>,
    ever_connected: AtomicBool,
    alerts: Mutex<VecDeque<Alert>>,
    multi_source: Mutex<HashMap<Symbol, VecDeque<(SourceId, Snapshot)>>>,
    counters: AtomicCounters,
    cancel: CancellationToken,
}

impl FlowOrchestrator {
    /// Create an orchestrator over the given transport and collaborators.
    #[must_use]
    pub fn new(
        config: OrchestratorConfig,
        components: PipelineComponents,
        transport: Arc<dyn Transport>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            transport,
            cache: components.cache,
            validator: components.validator,
            tracker: components.tracker,
            latency: components.latency,
            bus: components.bus,
            codec: JsonCodec::new(),
            state: Mutex::new(ConnectionState::Disconnected),
            ever_connected: AtomicBool::new(false),
            alerts: Mutex::new(VecDeque::new()),
            multi_source: Mutex::new(HashMap::new()),
            counters: AtomicCounters::default(),
            cancel,
        }
    }

    /// Consume transport events until destroyed or the channel closes.
    ///
    /// Runs the metrics tick alongside; the tick only fires while connected
    /// and stops deterministically when `destroy()` cancels the token.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<TransportEvent>) {
        let mut ticker = tokio::time::interval(self.config.metrics_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Orchestrator cancelled");
                    break;
                }
                event = events.recv() => {
                    let Some(event) = event else {
                        tracing::debug!("Transport event channel closed");
                        break;
                    };
                    self.handle_transport_event(event);
                }
                _ = ticker.tick() => {
                    if self.state() == ConnectionState::Connected {
                        self.metrics_tick().await;
                    }
                }
            }
        }
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Lifetime counter snapshot.
    #[must_use]
    pub fn counters(&self) -> PipelineCounters {
        self.counters.snapshot()
    }

    /// Alerts currently retained, oldest first.
    #[must_use]
    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().iter().cloned().collect()
    }

    /// Drop the whole alert log immediately.
    pub fn clear_alerts(&self) {
        self.alerts.lock().clear();
    }

    /// Latest cached snapshot for a symbol, if fresh.
    #[must_use]
    pub fn cached_snapshot(&self, symbol: &str) -> Option<Snapshot> {
        self.cache.get(&format!("market:{symbol}"))
    }

    /// Buffered per-source snapshots for a symbol.
    #[must_use]
    pub fn multi_source_view(&self, symbol: &str) -> HashMap<SourceId, Snapshot> {
        self.multi_source
            .lock()
            .get(symbol)
            .map(|buffer| buffer.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Run the cross-source consistency check over the buffered snapshots.
    #[must_use]
    pub fn cross_source_report(&self, symbol: &str) -> CrossSourceReport {
        let view = self.multi_source_view(symbol);
        self.validator.validate_cross_sources(&view)
    }

    /// Subscribe to stream data for the listed symbols.
    pub async fn subscribe(&self, symbols: Vec<String>) {
        self.send_control(ControlMessage::subscribe(symbols)).await;
    }

    /// Unsubscribe from stream data for the listed symbols.
    pub async fn unsubscribe(&self, symbols: Vec<String>) {
        self.send_control(ControlMessage::unsubscribe(symbols)).await;
    }

    /// Tear the transport connection down. Idempotent, safe before connect.
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Terminal teardown: stop the metrics tick and refuse further pipeline
    /// work. Idempotent; later transport messages are ignored, never a
    /// panic.
    pub fn destroy(&self) {
        *self.state.lock() = ConnectionState::Destroyed;
        self.cancel.cancel();
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_transport_event(&self, event: TransportEvent) {
        if self.state() == ConnectionState::Destroyed {
            return;
        }

        match event {
            TransportEvent::Connecting => {
                *self.state.lock() = ConnectionState::Connecting;
            }
            TransportEvent::Connected => {
                *self.state.lock() = ConnectionState::Connected;
                if self.ever_connected.swap(true, Ordering::SeqCst) {
                    self.tracker.record_reconnect();
                }
                self.tracker.record_connected();
                flow_metrics::set_connection_up(true);
                let _ = self.bus.send_connection(ConnectionEvent::Connected);
                self.push_alert(Alert::new(
                    AlertKind::Connection,
                    AlertSeverity::Info,
                    "feed connection established",
                ));
            }
            TransportEvent::Message(raw) => self.process_message(&raw),
            TransportEvent::Error(error) => {
                self.push_alert(Alert::new(
                    AlertKind::Connection,
                    AlertSeverity::Error,
                    format!("transport error: {error}"),
                ));
            }
            TransportEvent::Closed { reason } => {
                *self.state.lock() = ConnectionState::Disconnected;
                self.tracker.record_disconnected();
                flow_metrics::set_connection_up(false);
                let _ = self.bus.send_connection(ConnectionEvent::Disconnected);
                self.push_alert(Alert::new(
                    AlertKind::Connection,
                    AlertSeverity::Warning,
                    reason.map_or_else(
                        || "feed connection closed".to_string(),
                        |r| format!("feed connection closed: {r}"),
                    ),
                ));
            }
        }
    }

    // =========================================================================
    // Per-message pipeline
    // =========================================================================

    fn process_message(&self, raw: &str) {
        let received_at = Utc::now();
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        self.tracker.record_message(raw.len());
        flow_metrics::record_message_received();

        let message = match self.codec.decode(raw) {
            Ok(message) => message,
            Err(error) => {
                self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
                flow_metrics::record_message_dropped(flow_metrics::DropReason::Parse);
                tracing::debug!(%error, "Dropped unparseable message");
                return;
            }
        };

        let data = match message {
            FeedMessage::MarketData(data) => data,
            FeedMessage::Pong(pong) => {
                self.tracker.record_probe_ack(&pong.id);
                self.emit_passthrough(&FeedMessage::Pong(pong));
                return;
            }
            FeedMessage::Error(error) => {
                self.push_alert(Alert::new(
                    AlertKind::Feed,
                    AlertSeverity::Warning,
                    format!("upstream error: {}", error.msg),
                ));
                self.emit_passthrough(&FeedMessage::Error(error));
                return;
            }
            other => {
                self.emit_passthrough(&other);
                return;
            }
        };

        let Some(snapshot) = data.into_snapshot() else {
            self.counters.parse_failures.fetch_add(1, Ordering::Relaxed);
            flow_metrics::record_message_dropped(flow_metrics::DropReason::Parse);
            tracing::debug!("Dropped record with unrepresentable timestamp");
            return;
        };

        match self.latency.record(snapshot.timestamp, received_at) {
            LatencyLevel::Normal => {}
            LatencyLevel::Warning => {
                self.push_alert(
                    Alert::new(
                        AlertKind::Latency,
                        AlertSeverity::Warning,
                        format!("feed latency above warning threshold for {}", snapshot.symbol),
                    )
                    .with_data(serde_json::json!({
                        "symbol": snapshot.symbol,
                        "latency_ms": (received_at - snapshot.timestamp).num_milliseconds(),
                    })),
                );
            }
            LatencyLevel::Critical => {
                self.push_alert(
                    Alert::new(
                        AlertKind::Latency,
                        AlertSeverity::Error,
                        format!("feed latency critical for {}", snapshot.symbol),
                    )
                    .with_data(serde_json::json!({
                        "symbol": snapshot.symbol,
                        "latency_ms": (received_at - snapshot.timestamp).num_milliseconds(),
                    })),
                );
            }
        }

        let report = self.validator.validate(&snapshot);
        if !report.is_valid {
            self.counters.invalid.fetch_add(1, Ordering::Relaxed);
            flow_metrics::record_message_dropped(flow_metrics::DropReason::Quality);
            self.push_alert(
                Alert::new(
                    AlertKind::Quality,
                    AlertSeverity::Error,
                    format!("snapshot rejected for {}", snapshot.symbol),
                )
                .with_data(serde_json::json!({ "errors": report.errors })),
            );
            return;
        }
        if !report.warnings.is_empty() {
            self.push_alert(
                Alert::new(
                    AlertKind::Quality,
                    AlertSeverity::Warning,
                    format!("snapshot warnings for {}", snapshot.symbol),
                )
                .with_data(serde_json::json!({ "warnings": report.warnings })),
            );
        }

        let detection = self.validator.detect_anomalies(&snapshot);
        if detection.has_anomaly {
            self.counters.anomalies.fetch_add(1, Ordering::Relaxed);
            flow_metrics::record_anomaly();
            let severity = if detection.confidence > 0.8 {
                AlertSeverity::Warning
            } else {
                AlertSeverity::Info
            };
            self.push_alert(
                Alert::new(
                    AlertKind::Anomaly,
                    severity,
                    detection
                        .description
                        .unwrap_or_else(|| format!("anomaly detected for {}", snapshot.symbol)),
                )
                .with_data(serde_json::json!({
                    "symbol": snapshot.symbol,
                    "confidence": detection.confidence,
                })),
            );
        }

        if let Some(bar) = &snapshot.ohlcv {
            self.validator.update_historical_data(&snapshot.symbol, bar);
        }
        self.buffer_snapshot(&snapshot);

        self.cache.set_with(
            &format!("market:{}", snapshot.symbol),
            snapshot.clone(),
            self.config.snapshot_ttl,
            &["market"],
        );

        self.counters.valid.fetch_add(1, Ordering::Relaxed);
        flow_metrics::record_message_valid();
        let _ = self.bus.send_data(DataEvent { snapshot });
    }

    fn emit_passthrough(&self, message: &FeedMessage) {
        self.counters.passthrough.fetch_add(1, Ordering::Relaxed);
        if let Ok(payload) = serde_json::to_value(message) {
            let _ = self.bus.send_passthrough(PassthroughEvent { payload });
        }
    }

    fn buffer_snapshot(&self, snapshot: &Snapshot) {
        let source = snapshot
            .source
            .clone()
            .unwrap_or_else(|| STREAM_SOURCE.to_string());

        let mut buffers = self.multi_source.lock();
        let buffer = buffers.entry(snapshot.symbol.clone()).or_default();
        if let Some(existing) = buffer.iter().position(|(id, _)| *id == source) {
            buffer.remove(existing);
        }
        buffer.push_back((source, snapshot.clone()));
        while buffer.len() > self.config.multi_source_cap {
            buffer.pop_front();
        }
    }

    fn push_alert(&self, alert: Alert) {
        {
            let mut alerts = self.alerts.lock();
            alerts.push_back(alert.clone());
            while alerts.len() > self.config.alert_capacity {
                alerts.pop_front();
            }
        }
        flow_metrics::record_alert(alert.severity.as_str());
        tracing::debug!(
            kind = ?alert.kind,
            severity = alert.severity.as_str(),
            message = %alert.message,
            "Pipeline alert"
        );
        let _ = self.bus.send_alert(alert);
    }

    // =========================================================================
    // Metrics tick
    // =========================================================================

    async fn metrics_tick(&self) {
        let counters = self.counters.snapshot();
        let cache_stats = self.cache.stats();
        let avg_latency_ms = self.latency.avg_latency_ms();
        let score = data_quality_score(counters.valid, counters.invalid, counters.anomalies);

        flow_metrics::set_cache_hit_rate(cache_stats.hit_rate());
        flow_metrics::set_feed_latency(avg_latency_ms);
        flow_metrics::set_data_quality_score(score);

        let _ = self.bus.send_metrics(PipelineMetrics {
            cache_hit_rate: cache_stats.hit_rate(),
            avg_latency_ms,
            data_quality_score: score,
            valid_messages: counters.valid,
            invalid_messages: counters.invalid,
            anomalies: counters.anomalies,
            timestamp: Utc::now(),
        });

        // Ride the tick for latency probing: one probe per interval.
        let probe_id = Uuid::new_v4().to_string();
        self.tracker.record_probe_sent(&probe_id);
        if let Err(error) = self.transport.send(ControlMessage::ping(probe_id)).await {
            tracing::debug!(%error, "Probe send failed");
        }
    }

    async fn send_control(&self, message: ControlMessage) {
        if let Err(error) = self.transport.send(message).await {
            self.push_alert(Alert::new(
                AlertKind::Connection,
                AlertSeverity::Warning,
                format!("control message send failed: {error}"),
            ));
        }
    }
}

/// Composite data quality score in `[0, 100]`.
///
/// `valid_rate * 80 + (1 - anomaly_rate) * 20` over lifetime totals. With no
/// gated messages yet the score reads 100: nothing bad has been observed.
#[must_use]
pub fn data_quality_score(valid: u64, invalid: u64, anomalies: u64) -> f64 {
    let total = valid + invalid;
    if total == 0 {
        return 100.0;
    }

    #[allow(clippy::cast_precision_loss)]
    let (valid_rate, anomaly_rate) = (
        valid as f64 / total as f64,
        anomalies as f64 / total as f64,
    );
    (valid_rate * 80.0 + (1.0 - anomaly_rate) * 20.0).clamp(0.0, 100.0)
}

// =============================================================================
// Tests
// =============================================================================
