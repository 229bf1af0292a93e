//! Inbound Feed
//!
//! Wire message types, JSON codec, and the WebSocket transport adapter for
//! the upstream price stream.

/// JSON codec for the feed protocol.
pub mod codec;

/// Wire message types.
pub mod messages;

/// WebSocket transport adapter.
pub mod ws;
