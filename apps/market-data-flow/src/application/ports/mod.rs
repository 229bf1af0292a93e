//! Port Interfaces
//!
//! Contracts for the external systems this pipeline talks to, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement them;
//! tests substitute fakes.
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`]: one upstream stream connection. Reconnect and backoff
//!   policy belong entirely to the transport side of this boundary.
//! - [`SourceFetcher`]: pull-based snapshot fetch from one data source.
//!
//! Inbound traffic arrives as [`TransportEvent`]s over an mpsc channel, in
//! arrival order, consumed by a single orchestrator task.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::snapshot::Snapshot;

// =============================================================================
// Transport
// =============================================================================

/// Events produced by a transport connection, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A connection attempt started.
    Connecting,
    /// The connection is up.
    Connected,
    /// One inbound frame.
    Message(String),
    /// A transport-level error. The connection may still be alive.
    Error(String),
    /// The connection closed.
    Closed {
        /// Close reason, when the peer supplied one.
        reason: Option<String>,
    },
}

/// Symbol list payload of a control-plane message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolList {
    /// Symbols the message applies to.
    pub symbols: Vec<String>,
}

/// Control-plane message sent upstream.
///
/// # Wire Format (JSON)
/// ```json
/// {"type": "subscribe", "data": {"symbols": ["AAPL", "MSFT"]}}
/// {"type": "unsubscribe", "data": {"symbols": ["AAPL"]}}
/// {"type": "ping", "id": "..."}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Start streaming the listed symbols.
    Subscribe {
        /// Symbols to add.
        data: SymbolList,
    },
    /// Stop streaming the listed symbols.
    Unsubscribe {
        /// Symbols to remove.
        data: SymbolList,
    },
    /// Latency probe; the upstream echoes the id back in a pong.
    Ping {
        /// Correlation id.
        id: String,
    },
}

impl ControlMessage {
    /// Build a subscribe message.
    #[must_use]
    pub fn subscribe(symbols: impl IntoIterator<Item = String>) -> Self {
        Self::Subscribe {
            data: SymbolList {
                symbols: symbols.into_iter().collect(),
            },
        }
    }

    /// Build an unsubscribe message.
    #[must_use]
    pub fn unsubscribe(symbols: impl IntoIterator<Item = String>) -> Self {
        Self::Unsubscribe {
            data: SymbolList {
                symbols: symbols.into_iter().collect(),
            },
        }
    }

    /// Build a latency probe.
    #[must_use]
    pub fn ping(id: impl Into<String>) -> Self {
        Self::Ping { id: id.into() }
    }
}

/// Transport-side failures surfaced to the application layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport has shut down and accepts no more messages.
    #[error("transport is closed")]
    Closed,

    /// Message could not be encoded.
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),

    /// Connection-level failure.
    #[error("transport failure: {0}")]
    Failed(String),
}

/// One upstream stream connection.
///
/// The implementation owns connection management; this port only carries
/// outbound control messages and teardown.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a control-plane message upstream.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] when the message cannot be queued or the
    /// transport has shut down.
    async fn send(&self, message: ControlMessage) -> Result<(), TransportError>;

    /// Tear the connection down. Idempotent.
    async fn disconnect(&self);
}

// =============================================================================
// Source fetcher
// =============================================================================

/// Failure of one source fetch attempt.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The source rejected or could not serve the request.
    #[error("source unavailable: {0}")]
    Unavailable(String),

    /// The fetch did not complete within the deadline.
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),

    /// The source responded with data that could not be interpreted.
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// Pull-based snapshot fetch from one upstream data source.
///
/// No contract beyond the signature is assumed: authentication, rate limits,
/// and wire formats are the implementation's private business.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch the latest snapshot for a symbol.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] on any failure; the aggregator treats every
    /// error the same way for failover purposes.
    async fn fetch(&self, symbol: &str) -> Result<Snapshot, FetchError>;
}

// =============================================================================
// Tests
// =============================================================================
