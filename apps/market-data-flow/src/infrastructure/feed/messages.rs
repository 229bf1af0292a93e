//! Feed Wire Message Types
//!
//! Types for deserializing messages from the upstream price stream. The
//! envelope is a tagged union discriminated by the `type` field, validated
//! once at the parse boundary so the rest of the pipeline works with an
//! exhaustive match instead of dynamically-shaped payloads.
//!
//! # Message Kinds
//!
//! - `market_data`: a price record, continues through the pipeline
//! - `heartbeat`, `pong`, `status`, `subscription`: control traffic,
//!   re-emitted to consumers without pipeline processing
//! - `error`: upstream-reported failure, surfaced as an alert

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::snapshot::{Ohlcv, Snapshot};

/// Inbound feed envelope, discriminated by the `type` field.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "market_data", "symbol": "AAPL", "timestamp": 1700000000000, ...}
/// {"type": "heartbeat", "timestamp": 1700000000000}
/// {"type": "pong", "id": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// One market price record.
    MarketData(MarketDataMessage),
    /// Upstream liveness signal.
    Heartbeat(HeartbeatMessage),
    /// Echo of a latency probe.
    Pong(PongMessage),
    /// Upstream status notice (market open/close, feed degradation).
    Status(StatusMessage),
    /// Confirmation of the active subscription set.
    Subscription(SubscriptionAckMessage),
    /// Upstream-reported error.
    Error(FeedErrorMessage),
}

impl FeedMessage {
    /// Whether this kind continues through the market-data pipeline.
    #[must_use]
    pub const fn is_market_data(&self) -> bool {
        matches!(self, Self::MarketData(_))
    }
}

/// One market price record as received on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketDataMessage {
    /// Ticker symbol.
    pub symbol: String,
    /// Record timestamp in epoch milliseconds.
    pub timestamp: i64,
    /// OHLCV bar, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ohlcv: Option<Ohlcv>,
    /// Previous session close.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_close: Option<Decimal>,
    /// Previous session volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_volume: Option<Decimal>,
    /// Upstream source id, when the feed multiplexes several.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl MarketDataMessage {
    /// Convert into the canonical [`Snapshot`].
    ///
    /// Returns `None` when the epoch-ms timestamp is not representable;
    /// callers treat that as a structural parse failure.
    #[must_use]
    pub fn into_snapshot(self) -> Option<Snapshot> {
        let timestamp = Snapshot::timestamp_from_millis(self.timestamp)?;
        let mut snapshot = Snapshot::new(self.symbol, timestamp);
        snapshot.ohlcv = self.ohlcv;
        snapshot.previous_close = self.previous_close;
        snapshot.previous_volume = self.previous_volume;
        snapshot.source = self.source;
        Some(snapshot)
    }
}

/// Upstream liveness signal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMessage {
    /// Heartbeat timestamp in epoch milliseconds, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

/// Echo of a latency probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMessage {
    /// Correlation id from the originating ping.
    pub id: String,
}

/// Upstream status notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Status code, e.g. `market_open`.
    pub status: String,
    /// Optional human-readable detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Confirmation of the active subscription set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAckMessage {
    /// Symbols currently streaming.
    #[serde(default)]
    pub symbols: Vec<String>,
}

/// Upstream-reported error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedErrorMessage {
    /// Numeric error code, when supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i32>,
    /// Error message.
    pub msg: String,
}

// =============================================================================
// Tests
// =============================================================================
