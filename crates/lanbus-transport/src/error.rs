use std::net::SocketAddr;

use lanbus_protocol::{PeerId, ProtocolError};

/// Errors that can occur in the transport layer.
///
/// Socket failures inside a running connection never reach callers as
/// errors; the connection closes and its handler hears about it once.
/// These variants cover what happens *around* a running connection:
/// opening it, starting it, and queueing onto it.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The connection was closed (or is closing) and takes no more messages.
    #[error("connection to {0} is closed")]
    ConnectionClosed(SocketAddr),

    /// Connecting to a remote address failed.
    #[error("connect to {addr} failed: {source}")]
    ConnectFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Binding the listening socket failed.
    #[error("bind failed: {0}")]
    BindFailed(#[source] std::io::Error),

    /// Accepting an incoming connection failed.
    #[error("accept failed: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Writing to the socket failed.
    #[error("send failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// Reading from the socket failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    /// Local or peer address of a socket couldn't be read.
    #[error("socket address unavailable: {0}")]
    SocketInfo(#[source] std::io::Error),

    /// A frame could not be encoded or decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// `start` was called on a connection that already started.
    #[error("connection to {0} already started")]
    AlreadyStarted(SocketAddr),

    /// The peer on this connection already identified itself.
    #[error("connection to {addr} is already identified as {peer_id}")]
    AlreadyIdentified { addr: SocketAddr, peer_id: PeerId },

    /// A worker task ended before signalling that it was ready.
    #[error("worker {0} exited before it was ready")]
    WorkerExited(String),
}
