//! Market Snapshot Types
//!
//! The canonical internal representation of one point-in-time market record
//! for a symbol. Snapshots are produced at the parse boundary (inbound feed
//! messages) or by source fetchers, and are immutable once constructed.

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A symbol string (ticker).
pub type Symbol = String;

/// Identifier of an upstream data source.
pub type SourceId = String;

// =============================================================================
// OHLCV
// =============================================================================

/// One OHLCV bar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ohlcv {
    /// Bar date.
    pub date: DateTime<Utc>,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: Decimal,
}

// =============================================================================
// Snapshot
// =============================================================================

/// One point-in-time market record for a symbol.
///
/// Immutable once constructed. Consumed by the validator, the cache, and
/// the multi-source aggregator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Source-side timestamp of the record.
    pub timestamp: DateTime<Utc>,
    /// OHLCV data, when the record carries it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ohlcv: Option<Ohlcv>,
    /// Previous session closing price, for change calculations.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_close: Option<Decimal>,
    /// Previous session volume.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_volume: Option<Decimal>,
    /// Source that produced this record, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceId>,
}

impl Snapshot {
    /// Create a snapshot with only the required fields.
    #[must_use]
    pub const fn new(symbol: Symbol, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            timestamp,
            ohlcv: None,
            previous_close: None,
            previous_volume: None,
            source: None,
        }
    }

    /// Convert an epoch-milliseconds timestamp into a UTC datetime.
    ///
    /// Returns `None` for values outside the representable chrono range.
    #[must_use]
    pub fn timestamp_from_millis(millis: i64) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(millis).single()
    }

    /// Attach an OHLCV bar.
    #[must_use]
    pub fn with_ohlcv(mut self, ohlcv: Ohlcv) -> Self {
        self.ohlcv = Some(ohlcv);
        self
    }

    /// Attach the previous session close.
    #[must_use]
    pub fn with_previous_close(mut self, close: Decimal) -> Self {
        self.previous_close = Some(close);
        self
    }

    /// Attach the previous session volume.
    #[must_use]
    pub fn with_previous_volume(mut self, volume: Decimal) -> Self {
        self.previous_volume = Some(volume);
        self
    }

    /// Attach the originating source id.
    #[must_use]
    pub fn with_source(mut self, source: SourceId) -> Self {
        self.source = Some(source);
        self
    }

    /// Current price of the snapshot (the bar close), if present.
    #[must_use]
    pub fn price(&self) -> Option<Decimal> {
        self.ohlcv.as_ref().map(|bar| bar.close)
    }

    /// Traded volume of the snapshot, if present.
    #[must_use]
    pub fn volume(&self) -> Option<Decimal> {
        self.ohlcv.as_ref().map(|bar| bar.volume)
    }

    /// Age of the record relative to `now`.
    ///
    /// Saturates to zero for timestamps in the future.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        (now - self.timestamp).max(chrono::Duration::zero())
    }
}

// =============================================================================
// Tests
// =============================================================================
