//! Connection Quality Tracking
//!
//! Maintains rolling health of one transport connection: probe round-trip
//! latency, packet loss, throughput, and a coarse quality classification.
//! Also provides the feed latency monitor used by the stream pipeline to
//! flag slow upstream data.
//!
//! Probes are correlated by id: `record_probe_sent` stamps an id and
//! `record_probe_ack` resolves it into an RTT sample. Probes that stay
//! pending past the timeout are counted as lost, not errored.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

// =============================================================================
// Quality classification
// =============================================================================

/// Coarse connection quality derived from latency and loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    /// Below 50ms average latency and below 1% loss.
    Excellent,
    /// Below 100ms average latency and below 3% loss.
    Good,
    /// Below 200ms average latency and below 5% loss.
    Fair,
    /// Anything worse.
    Poor,
    /// No measurements yet, or disconnected.
    Offline,
}

impl ConnectionQuality {
    /// Label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Offline => "offline",
        }
    }

    /// Classify from average latency and loss rate.
    #[must_use]
    pub fn classify(avg_latency_ms: f64, loss_rate: f64) -> Self {
        if avg_latency_ms < 50.0 && loss_rate < 0.01 {
            Self::Excellent
        } else if avg_latency_ms < 100.0 && loss_rate < 0.03 {
            Self::Good
        } else if avg_latency_ms < 200.0 && loss_rate < 0.05 {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

// =============================================================================
// Configuration and metrics
// =============================================================================

/// Tracker tuning knobs.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Pending probes older than this count as lost.
    pub probe_timeout: Duration,
    /// Number of RTT samples kept for the rolling average.
    pub latency_window: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(10),
            latency_window: 30,
        }
    }
}

/// Immutable view of connection health.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    /// Most recent probe RTT in milliseconds.
    pub latency_ms: f64,
    /// Rolling average RTT in milliseconds.
    pub avg_latency_ms: f64,
    /// Smallest RTT observed.
    pub min_latency_ms: f64,
    /// Largest RTT observed.
    pub max_latency_ms: f64,
    /// Probes sent.
    pub probes_sent: u64,
    /// Probes acknowledged.
    pub probes_acked: u64,
    /// Probes that timed out.
    pub probes_lost: u64,
    /// Lost probes over sent probes, zero with no probes.
    pub loss_rate: f64,
    /// Messages per second over the last full window.
    pub msgs_per_sec: f64,
    /// Bytes per second over the last full window.
    pub bytes_per_sec: f64,
    /// Current quality classification.
    pub quality: ConnectionQuality,
    /// Reconnections observed.
    pub reconnect_count: u32,
    /// Time since the connection came up, zero while down.
    pub uptime: Duration,
}

// =============================================================================
// Tracker
// =============================================================================

#[derive(Debug)]
struct TrackerState {
    pending: HashMap<String, Instant>,
    rtt_window: VecDeque<f64>,
    latency_ms: f64,
    min_latency_ms: f64,
    max_latency_ms: f64,
    probes_sent: u64,
    probes_acked: u64,
    probes_lost: u64,
    window_start: Instant,
    window_msgs: u64,
    window_bytes: u64,
    msgs_per_sec: f64,
    bytes_per_sec: f64,
    connected_at: Option<Instant>,
    reconnect_count: u32,
}

impl TrackerState {
    fn new() -> Self {
        Self {
            pending: HashMap::new(),
            rtt_window: VecDeque::new(),
            latency_ms: 0.0,
            min_latency_ms: f64::INFINITY,
            max_latency_ms: 0.0,
            probes_sent: 0,
            probes_acked: 0,
            probes_lost: 0,
            window_start: Instant::now(),
            window_msgs: 0,
            window_bytes: 0,
            msgs_per_sec: 0.0,
            bytes_per_sec: 0.0,
            connected_at: None,
            reconnect_count: 0,
        }
    }

    fn sweep_lost(&mut self, now: Instant, timeout: Duration) {
        let before = self.pending.len();
        self.pending
            .retain(|_, sent_at| now.duration_since(*sent_at) < timeout);
        self.probes_lost += (before - self.pending.len()) as u64;
    }

    fn avg_latency_ms(&self) -> f64 {
        if self.rtt_window.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.rtt_window.iter().sum::<f64>() / self.rtt_window.len() as f64
            }
        }
    }

    fn loss_rate(&self) -> f64 {
        if self.probes_sent == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.probes_lost as f64 / self.probes_sent as f64
            }
        }
    }

    fn quality(&self) -> ConnectionQuality {
        if self.connected_at.is_none() || self.rtt_window.is_empty() {
            ConnectionQuality::Offline
        } else {
            ConnectionQuality::classify(self.avg_latency_ms(), self.loss_rate())
        }
    }
}

/// Rolling health tracker for one transport connection.
///
/// Thread-safe; shared between the orchestrator task and the health server.
pub struct ConnectionTracker {
    config: TrackerConfig,
    state: Mutex<TrackerState>,
}

impl ConnectionTracker {
    /// Create a tracker with the given configuration.
    #[must_use]
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(TrackerState::new()),
        }
    }

    /// Create a tracker with default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(TrackerConfig::default())
    }

    /// Timestamp an outgoing probe and sweep timed-out ones.
    pub fn record_probe_sent(&self, id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_lost(now, self.config.probe_timeout);
        state.pending.insert(id.to_string(), now);
        state.probes_sent += 1;
    }

    /// Resolve a probe acknowledgment into an RTT sample.
    ///
    /// Unknown ids are silently ignored.
    pub fn record_probe_ack(&self, id: &str) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let Some(sent_at) = state.pending.remove(id) else {
            return;
        };

        let rtt_ms = now.duration_since(sent_at).as_secs_f64() * 1000.0;
        state.latency_ms = rtt_ms;
        state.min_latency_ms = state.min_latency_ms.min(rtt_ms);
        state.max_latency_ms = state.max_latency_ms.max(rtt_ms);
        state.probes_acked += 1;

        state.rtt_window.push_back(rtt_ms);
        while state.rtt_window.len() > self.config.latency_window {
            state.rtt_window.pop_front();
        }
    }

    /// Account one inbound message against the 1-second throughput window.
    pub fn record_message(&self, size_bytes: usize) {
        let now = Instant::now();
        let mut state = self.state.lock();

        let elapsed = now.duration_since(state.window_start);
        if elapsed >= Duration::from_secs(1) {
            let secs = elapsed.as_secs_f64();
            #[allow(clippy::cast_precision_loss)]
            {
                state.msgs_per_sec = state.window_msgs as f64 / secs;
                state.bytes_per_sec = state.window_bytes as f64 / secs;
            }
            state.window_start = now;
            state.window_msgs = 0;
            state.window_bytes = 0;
        }

        state.window_msgs += 1;
        state.window_bytes += size_bytes as u64;
    }

    /// Mark the connection as up.
    pub fn record_connected(&self) {
        let mut state = self.state.lock();
        state.connected_at = Some(Instant::now());
    }

    /// Mark the connection as down.
    ///
    /// Uptime drops to zero and quality reads as offline until the next
    /// connection comes up and produces samples.
    pub fn record_disconnected(&self) {
        let mut state = self.state.lock();
        state.connected_at = None;
        state.pending.clear();
    }

    /// Count one reconnection.
    pub fn record_reconnect(&self) {
        self.state.lock().reconnect_count += 1;
    }

    /// Immutable copy of the current metrics.
    #[must_use]
    pub fn snapshot(&self) -> ConnectionMetrics {
        let now = Instant::now();
        let mut state = self.state.lock();
        state.sweep_lost(now, self.config.probe_timeout);

        ConnectionMetrics {
            latency_ms: state.latency_ms,
            avg_latency_ms: state.avg_latency_ms(),
            min_latency_ms: if state.min_latency_ms.is_finite() {
                state.min_latency_ms
            } else {
                0.0
            },
            max_latency_ms: state.max_latency_ms,
            probes_sent: state.probes_sent,
            probes_acked: state.probes_acked,
            probes_lost: state.probes_lost,
            loss_rate: state.loss_rate(),
            msgs_per_sec: state.msgs_per_sec,
            bytes_per_sec: state.bytes_per_sec,
            quality: state.quality(),
            reconnect_count: state.reconnect_count,
            uptime: state
                .connected_at
                .map_or(Duration::ZERO, |at| now.duration_since(at)),
        }
    }
}

// =============================================================================
// Feed latency monitor
// =============================================================================

/// Severity of a feed latency observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyLevel {
    /// Within the warning threshold.
    Normal,
    /// Past the warning threshold.
    Warning,
    /// Past the critical threshold.
    Critical,
}

/// Feed latency monitor configuration.
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    /// Source-to-receipt delay that raises a warning.
    pub warning: Duration,
    /// Source-to-receipt delay that raises a critical alert.
    pub critical: Duration,
    /// Number of samples kept for the rolling average.
    pub window: usize,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            warning: Duration::from_secs(1),
            critical: Duration::from_secs(5),
            window: 100,
        }
    }
}

/// Tracks source-to-receipt delay of stream messages.
pub struct FeedLatencyMonitor {
    config: LatencyConfig,
    samples: Mutex<VecDeque<f64>>,
}

impl FeedLatencyMonitor {
    /// Create a monitor with the given configuration.
    #[must_use]
    pub fn new(config: LatencyConfig) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
        }
    }

    /// Create a monitor with default thresholds.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(LatencyConfig::default())
    }

    /// Record one message delay and classify it.
    ///
    /// Negative delays (source clock ahead of ours) clamp to zero.
    pub fn record(&self, source_ts: DateTime<Utc>, received_at: DateTime<Utc>) -> LatencyLevel {
        let delay_ms = (received_at - source_ts).num_milliseconds().max(0);
        #[allow(clippy::cast_precision_loss)]
        let delay_ms_f = delay_ms as f64;

        let mut samples = self.samples.lock();
        samples.push_back(delay_ms_f);
        while samples.len() > self.config.window {
            samples.pop_front();
        }
        drop(samples);

        let delay = Duration::from_millis(delay_ms.unsigned_abs());
        if delay >= self.config.critical {
            LatencyLevel::Critical
        } else if delay >= self.config.warning {
            LatencyLevel::Warning
        } else {
            LatencyLevel::Normal
        }
    }

    /// Rolling average delay in milliseconds.
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.is_empty() {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
