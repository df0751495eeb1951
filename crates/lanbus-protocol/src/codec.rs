//! Codec trait and implementations for serializing message payloads.
//!
//! A codec only turns values into bytes and back. It knows nothing about
//! streams; length-prefixing a payload so a stream reader can find its end
//! is the job of [`frame`](crate::frame).

use serde::{Serialize, de::DeserializeOwned};

use crate::ProtocolError;

/// Encodes values to bytes and decodes them back.
///
/// ## Trait bounds
///
/// - `Send + Sync`: a codec is used from the send and receive loops of
///   every connection, and those run on whichever runtime thread picks
///   them up.
/// - `'static`: the codec owns what it needs, so it can live in a spawned
///   task for as long as the connection does.
///
/// ## Generic methods
///
/// `encode` and `decode` are generic over the value type, which keeps the
/// trait usable for the frame payload and for anything else a test wants
/// to push through it. `decode` asks for `DeserializeOwned` rather than
/// `Deserialize<'de>`: the decoded message must not borrow from the read
/// buffer, because the receive loop drops that buffer as soon as the
/// payload is decoded.
pub trait Codec: Send + Sync + 'static {
    /// Serializes a value into bytes.
    ///
    /// # Errors
    /// Returns `ProtocolError::Encode` if the value can't be represented in
    /// this format.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError>;

    /// Deserializes bytes back into a value.
    ///
    /// # Errors
    /// Returns `ProtocolError::Decode` if the bytes are malformed,
    /// incomplete, or don't match the expected type.
    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError>;
}

// ---------------------------------------------------------------------------
// JsonCodec
// ---------------------------------------------------------------------------

/// A [`Codec`] that uses JSON (via `serde_json`).
///
/// Readable in a packet capture, which is worth more on a LAN game than
/// the bytes a binary format would save.
///
/// ```rust
/// use lanbus_protocol::{Codec, JsonCodec, Message, PrintRequest};
///
/// let codec = JsonCodec;
/// let message = Message::from(PrintRequest::new("hi"));
///
/// let bytes = codec.encode(&message).unwrap();
/// let decoded: Message = codec.decode(&bytes).unwrap();
/// assert_eq!(message, decoded);
/// ```
#[cfg(feature = "json")]
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[cfg(feature = "json")]
impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(value).map_err(ProtocolError::Encode)
    }

    fn decode<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, ProtocolError> {
        serde_json::from_slice(data).map_err(ProtocolError::Decode)
    }
}

#[cfg(all(test, feature = "json"))]
mod tests {
    use super::*;
    use crate::{Message, MessageId, RequestFail};

    #[test]
    fn test_json_payload_is_adjacently_tagged() {
        let message = Message::from(RequestFail {
            request_id: MessageId::random(),
            error: "nope".into(),
        });
        let bytes = JsonCodec.encode(&message).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["payload"]["type"], "Fail");
        assert_eq!(value["payload"]["data"]["error"], "nope");
    }

    #[test]
    fn test_json_decode_garbage_is_decode_error() {
        let result: Result<Message, _> = JsonCodec.decode(b"{not json");
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[test]
    fn test_json_decode_unknown_variant_is_decode_error() {
        let bytes = br#"{"id":"00000000-0000-0000-0000-000000000000","payload":{"type":"Teleport","data":{}}}"#;
        let result: Result<Message, _> = JsonCodec.decode(bytes);
        assert!(result.is_err());
    }
}
