//! Stream framing: a fixed-size length header followed by the payload.
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────┐
//! │ IncomingRequest    │ payload                      │
//! │ 4 bytes (u32 BE)   │ payload_size bytes (codec)   │
//! └────────────────────┴──────────────────────────────┘
//! ```
//!
//! The header is always exactly [`HEADER_SIZE`] bytes whatever length it
//! carries. A reader pulls exactly that many bytes, learns the payload
//! length, then pulls exactly the payload. If the header's own size could
//! vary, the reader would either cut a header short or swallow the first
//! bytes of the next frame.

use crate::{Codec, Message, ProtocolError};

/// Size in bytes of every frame header.
pub const HEADER_SIZE: usize = 4;

/// Largest payload the header can describe.
pub const MAX_FRAME_PAYLOAD: usize = u32::MAX as usize;

/// Frame header announcing the exact byte length of the payload that
/// follows. Never dispatched to handlers and never acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncomingRequest {
    pub payload_size: u32,
}

impl IncomingRequest {
    /// Header for a payload of `len` bytes.
    ///
    /// # Errors
    /// [`ProtocolError::PayloadTooLarge`] if `len` doesn't fit in the
    /// header's 32 bits.
    pub fn for_payload(len: usize) -> Result<Self, ProtocolError> {
        let payload_size = u32::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge {
            size: len as u64,
            limit: u64::from(u32::MAX),
        })?;
        Ok(Self { payload_size })
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        self.payload_size.to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; HEADER_SIZE]) -> Self {
        Self {
            payload_size: u32::from_be_bytes(bytes),
        }
    }

    /// Payload length as a buffer size.
    pub fn payload_len(self) -> usize {
        self.payload_size as usize
    }

    /// Rejects headers announcing more than `limit` bytes, before the
    /// reader allocates anything.
    pub fn check_limit(self, limit: u32) -> Result<Self, ProtocolError> {
        if self.payload_size > limit {
            return Err(ProtocolError::PayloadTooLarge {
                size: u64::from(self.payload_size),
                limit: u64::from(limit),
            });
        }
        Ok(self)
    }
}

/// Encodes `message` as one complete frame (header + payload), ready to be
/// written to a stream in a single call.
pub fn encode_frame<C: Codec>(codec: &C, message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = codec.encode(message)?;
    let header = IncomingRequest::for_payload(payload.len())?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reads the header at the start of `bytes`.
pub fn decode_header(bytes: &[u8]) -> Result<IncomingRequest, ProtocolError> {
    let header: [u8; HEADER_SIZE] = bytes
        .get(..HEADER_SIZE)
        .and_then(|slice| slice.try_into().ok())
        .ok_or(ProtocolError::Truncated {
            expected: HEADER_SIZE,
            actual: bytes.len(),
        })?;
    Ok(IncomingRequest::from_bytes(header))
}

/// Decodes the first frame in `bytes`.
///
/// Returns the message and the number of bytes the frame occupied, so a
/// caller holding several frames back to back can advance past it.
pub fn decode_frame<C: Codec>(codec: &C, bytes: &[u8]) -> Result<(Message, usize), ProtocolError> {
    let header = decode_header(bytes)?;
    let end = HEADER_SIZE + header.payload_len();
    let payload = bytes.get(HEADER_SIZE..end).ok_or(ProtocolError::Truncated {
        expected: end,
        actual: bytes.len(),
    })?;
    let message: Message = codec.decode(payload)?;
    message.validate()?;
    Ok((message, end))
}
