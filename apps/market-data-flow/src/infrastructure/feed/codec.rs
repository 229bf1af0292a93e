//! Feed Codec
//!
//! JSON encoding and decoding for the upstream stream protocol. Decode
//! failures are values, never panics: the pipeline counts them and moves on.

use crate::application::ports::ControlMessage;

use super::messages::FeedMessage;

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// JSON codec for the feed protocol.
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one inbound frame into a [`FeedMessage`].
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] for malformed JSON or an unknown message kind.
    pub fn decode(&self, raw: &str) -> Result<FeedMessage, CodecError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Encode an outbound control-plane message.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError`] when serialization fails.
    pub fn encode_control(&self, message: &ControlMessage) -> Result<String, CodecError> {
        Ok(serde_json::to_string(message)?)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_market_data() {
        let codec = JsonCodec::new();
        let message = codec
            .decode(r#"{"type": "market_data", "symbol": "AAPL", "timestamp": 1700000000000}"#)
            .unwrap();
        assert!(message.is_market_data());
    }

    #[test]
    fn malformed_json_is_an_error_value() {
        let codec = JsonCodec::new();
        assert!(codec.decode("{not json").is_err());
    }

    #[test]
    fn missing_required_field_is_an_error_value() {
        let codec = JsonCodec::new();
        assert!(codec.decode(r#"{"type": "market_data"}"#).is_err());
    }

    #[test]
    fn encodes_control_messages() {
        let codec = JsonCodec::new();
        let encoded = codec
            .encode_control(&ControlMessage::subscribe(vec!["AAPL".to_string()]))
            .unwrap();
        assert!(encoded.contains(r#""type":"subscribe""#));
        assert!(encoded.contains("AAPL"));
    }
}
