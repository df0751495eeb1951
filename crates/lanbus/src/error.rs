//! Unified error type for the bus.

use std::net::SocketAddr;

use lanbus_protocol::ProtocolError;
use lanbus_transport::TransportError;

/// Top-level error returned by every bus operation.
///
/// Lower-layer errors convert automatically through `#[from]`, so `?` works
/// on transport and protocol results inside the bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// A transport-level error (connect, bind, start).
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A protocol-level error (encode, decode, invalid message).
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// No identified connection exists for this address. Expected while the
    /// handshake for that address is still in flight; retry later.
    #[error("no identified peer at {0}")]
    PeerNotFound(SocketAddr),

    /// The identity handshake on a new connection did not complete.
    #[error("handshake with {addr} failed: {reason}")]
    HandshakeFailed { addr: SocketAddr, reason: String },

    /// `send` was called on a bus that isn't started.
    #[error("bus is not running")]
    NotRunning,

    /// `start` was called on a bus that is already running.
    #[error("bus is already running")]
    AlreadyRunning,
}
