//! Error types for the protocol layer.
//!
//! A `ProtocolError` always means the bytes were wrong: they could not be
//! produced, could not be parsed, or announced a frame the receiver refuses
//! to read. Networking failures live in the transport crate.

/// Errors that can occur while encoding, decoding, or framing messages.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Serialization failed (turning a message into bytes).
    #[cfg(feature = "json")]
    #[error("encode failed: {0}")]
    Encode(serde_json::Error),

    /// Deserialization failed (turning bytes into a message).
    ///
    /// Common causes: a corrupted payload, or a reader that fell out of
    /// step with the frame boundaries and is decoding the middle of a
    /// frame.
    #[cfg(feature = "json")]
    #[error("decode failed: {0}")]
    Decode(serde_json::Error),

    /// A payload is larger than the receiver's limit, or larger than the
    /// fixed-width header can describe.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: u64, limit: u64 },

    /// Fewer bytes were available than the frame announced.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// The message decoded but breaks a protocol rule.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}
