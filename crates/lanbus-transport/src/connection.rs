//! One TCP socket to one peer, driven by two independent loops.
//!
//! ```text
//!            enqueue()                               ConnectionHandler
//!               │                                          ▲
//!               ▼                                          │ on_message
//!   ┌───── outbound queue ─────┐              ┌──── recv loop ─────┐
//!   │ send loop: frame + write │──── TCP ────►│ read header, then  │
//!   └──────────────────────────┘              │ payload; respond   │
//!                                             └────────────────────┘
//! ```
//!
//! Both loops poll with `poll_interval` and watch a shared state channel.
//! Whichever of them (or an explicit [`Connection::close`]) first moves the
//! state to [`ConnectionState::Closing`] wins; the other loop sees the
//! change and exits, and [`ConnectionHandler::on_closed`] runs exactly once.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use lanbus_protocol::frame::encode_frame;
use lanbus_protocol::{Codec, HEADER_SIZE, IncomingRequest, JsonCodec, Message, PeerId};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};

use crate::poll::{Readiness, can_read, can_write};
use crate::worker::{ReadySignal, Worker};
use crate::TransportError;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Lifecycle of a [`Connection`]. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Socket exists, loops not yet running.
    Opening,
    /// Both loops are polling.
    Active,
    /// A loop failed or `close` was called; the loops are exiting.
    Closing,
    /// Both loops have been joined.
    Closed,
}

impl ConnectionState {
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Closing | Self::Closed)
    }
}

/// Per-connection tuning.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Upper bound on how long a loop waits on the socket before checking
    /// whether it should stop.
    pub poll_interval: Duration,
    /// Frames announcing a larger payload close the connection.
    pub max_payload_size: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

/// Receives everything a connection has to report to its owner.
///
/// Both methods run on the connection's receive task (or on whichever task
/// closes the connection) and must not block for long.
pub trait ConnectionHandler: Send + Sync + 'static {
    /// Called for every decoded payload message. Header frames are never
    /// delivered.
    ///
    /// If `message` is a request, the returned outcome becomes its
    /// `RequestSuccess` or `RequestFail`, queued on this connection before
    /// the next frame is read.
    fn on_message(&self, from: SocketAddr, message: &Message) -> Result<(), String>;

    /// Called exactly once, when the connection starts closing for any
    /// reason.
    fn on_closed(&self, target: SocketAddr);
}

// ---------------------------------------------------------------------------
// Shared loop state
// ---------------------------------------------------------------------------

struct Shared {
    target_address: SocketAddr,
    state: watch::Sender<ConnectionState>,
    handler: Arc<dyn ConnectionHandler>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl Shared {
    /// Moves to `Closing` unless already there. Only the caller that makes
    /// the move notifies the handler.
    fn begin_closing(&self) -> bool {
        let won = self.state.send_if_modified(|state| match state {
            ConnectionState::Opening | ConnectionState::Active => {
                *state = ConnectionState::Closing;
                true
            }
            ConnectionState::Closing | ConnectionState::Closed => false,
        });
        if won {
            tracing::debug!(target = %self.target_address, "connection closing");
            self.handler.on_closed(self.target_address);
        }
        won
    }

    fn deliver(&self, message: Message) {
        tracing::trace!(
            from = %self.target_address,
            id = %message.id,
            kind = %message.message_type(),
            "message received"
        );
        let outcome = self.handler.on_message(self.target_address, &message);

        if message.requires_response() {
            if let Some(response) = message.response(outcome) {
                // Fails only once the send loop is gone, i.e. while closing.
                let _ = self.outbound.send(response);
            }
        } else if let Err(error) = outcome {
            tracing::warn!(
                from = %self.target_address,
                id = %message.id,
                %error,
                "handler failed on a message that takes no response"
            );
        }
    }
}

/// Closes the connection when a loop exits, however it exits.
struct CloseOnExit(Arc<Shared>);

impl Drop for CloseOnExit {
    fn drop(&mut self) {
        self.0.begin_closing();
    }
}

/// Resolves once the state reaches `Closing` (or the sender is gone).
async fn wait_closing(state: &mut watch::Receiver<ConnectionState>) {
    loop {
        if state.borrow_and_update().is_closing() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

// ---------------------------------------------------------------------------
// Connection
// ---------------------------------------------------------------------------

struct Pending {
    stream: TcpStream,
    outbound: mpsc::UnboundedReceiver<Message>,
}

/// A framed, bidirectional message channel to a single peer.
pub struct Connection {
    local_uuid: PeerId,
    remote_uuid: watch::Sender<Option<PeerId>>,
    source_address: SocketAddr,
    config: ConnectionConfig,
    shared: Arc<Shared>,
    /// Socket and queue receiver, held until `start` hands them to the loops.
    pending: Mutex<Option<Pending>>,
    workers: tokio::sync::Mutex<Vec<Worker>>,
}

impl Connection {
    /// Connects to `target`. The connection is `Opening` until
    /// [`start`](Self::start) is called.
    pub async fn connect(
        target: SocketAddr,
        local_uuid: PeerId,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(target)
            .await
            .map_err(|source| TransportError::ConnectFailed {
                addr: target,
                source,
            })?;
        Self::from_stream(stream, local_uuid, handler, config)
    }

    /// Wraps an already connected socket, e.g. one from an accept.
    pub fn from_stream(
        stream: TcpStream,
        local_uuid: PeerId,
        handler: Arc<dyn ConnectionHandler>,
        config: ConnectionConfig,
    ) -> Result<Self, TransportError> {
        stream.set_nodelay(true).map_err(TransportError::SocketInfo)?;
        let source_address = stream.local_addr().map_err(TransportError::SocketInfo)?;
        let target_address = stream.peer_addr().map_err(TransportError::SocketInfo)?;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            target_address,
            state: watch::Sender::new(ConnectionState::Opening),
            handler,
            outbound: outbound_tx,
        });

        tracing::debug!(%source_address, %target_address, "connection opened");

        Ok(Self {
            local_uuid,
            remote_uuid: watch::Sender::new(None),
            source_address,
            config,
            shared,
            pending: Mutex::new(Some(Pending {
                stream,
                outbound: outbound_rx,
            })),
            workers: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Starts the send and receive loops and returns once both are polling.
    ///
    /// # Errors
    /// - [`TransportError::AlreadyStarted`] on a second call.
    /// - [`TransportError::ConnectionClosed`] if the connection closed first.
    /// - [`TransportError::WorkerExited`] if a loop died during startup; the
    ///   connection is closed in that case.
    pub async fn start(&self) -> Result<(), TransportError> {
        let target = self.target_address();
        let mut workers = self.workers.lock().await;

        if self.state().is_closing() {
            return Err(TransportError::ConnectionClosed(target));
        }
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Pending { stream, outbound }) = pending else {
            return Err(TransportError::AlreadyStarted(target));
        };
        let (reader, writer) = stream.into_split();

        let shared = Arc::clone(&self.shared);
        let config = self.config;
        let send = Worker::spawn(format!("send-{target}"), move |ready| {
            send_loop(shared, writer, outbound, config, ready)
        })
        .await_ready()
        .await;
        match send {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                self.shared.begin_closing();
                return Err(e);
            }
        }

        let shared = Arc::clone(&self.shared);
        let recv = Worker::spawn(format!("recv-{target}"), move |ready| {
            recv_loop(shared, reader, config, ready)
        })
        .await_ready()
        .await;
        match recv {
            Ok(worker) => workers.push(worker),
            Err(e) => {
                self.shared.begin_closing();
                for worker in workers.drain(..) {
                    worker.join().await;
                }
                return Err(e);
            }
        }

        self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Opening {
                *state = ConnectionState::Active;
                true
            } else {
                false
            }
        });
        tracing::debug!(%target, "connection active");
        Ok(())
    }

    /// Queues `message` for the send loop. Never blocks.
    pub fn enqueue(&self, message: Message) -> Result<(), TransportError> {
        let target = self.target_address();
        if self.state().is_closing() {
            return Err(TransportError::ConnectionClosed(target));
        }
        self.shared
            .outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed(target))
    }

    /// Stops both loops and waits for them to finish. Idempotent; every call
    /// returns only after the loops have been joined.
    pub async fn close(&self) {
        let mut workers = self.workers.lock().await;
        self.shared.begin_closing();
        drop(
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        for worker in workers.drain(..) {
            worker.join().await;
        }
        let closed_now = self.shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if closed_now {
            tracing::debug!(target = %self.target_address(), "connection closed");
        }
    }

    /// Records the peer's identity. Allowed once.
    pub fn identify(&self, peer_id: PeerId) -> Result<(), TransportError> {
        let mut result = Ok(());
        self.remote_uuid.send_if_modified(|current| match current {
            Some(existing) => {
                result = Err(TransportError::AlreadyIdentified {
                    addr: self.shared.target_address,
                    peer_id: *existing,
                });
                false
            }
            None => {
                *current = Some(peer_id);
                true
            }
        });
        result
    }

    /// Waits until the peer has identified itself. Returns `None` if the
    /// connection closes first.
    pub async fn wait_identified(&self) -> Option<PeerId> {
        let mut identity = self.remote_uuid.subscribe();
        let mut state = self.shared.state.subscribe();
        loop {
            let current = *identity.borrow_and_update();
            if let Some(peer_id) = current {
                return Some(peer_id);
            }
            if state.borrow_and_update().is_closing() {
                return None;
            }
            tokio::select! {
                changed = identity.changed() => if changed.is_err() { return None },
                changed = state.changed() => if changed.is_err() { return None },
            }
        }
    }

    pub fn remote_uuid(&self) -> Option<PeerId> {
        *self.remote_uuid.borrow()
    }

    pub fn local_uuid(&self) -> PeerId {
        self.local_uuid
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// This end of the socket.
    pub fn source_address(&self) -> SocketAddr {
        self.source_address
    }

    /// The peer's end of the socket.
    pub fn target_address(&self) -> SocketAddr {
        self.shared.target_address
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.begin_closing();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("source_address", &self.source_address)
            .field("target_address", &self.shared.target_address)
            .field("remote_uuid", &self.remote_uuid())
            .field("state", &self.state())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Loops
// ---------------------------------------------------------------------------

async fn send_loop(
    shared: Arc<Shared>,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    config: ConnectionConfig,
    ready: ReadySignal,
) {
    let _close = CloseOnExit(Arc::clone(&shared));
    let mut state = shared.state.subscribe();
    ready.notify();

    loop {
        let message = tokio::select! {
            _ = wait_closing(&mut state) => break,
            next = outbound.recv() => match next {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match encode_frame(&JsonCodec, &message) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(target = %shared.target_address, error = %e, "dropping connection: encode failed");
                break;
            }
        };

        let written = tokio::select! {
            _ = wait_closing(&mut state) => break,
            written = write_frame(&mut writer, &frame, config.poll_interval) => written,
        };
        match written {
            Ok(()) => tracing::trace!(
                target = %shared.target_address,
                id = %message.id,
                bytes = frame.len(),
                "frame sent"
            ),
            Err(e) => {
                tracing::debug!(target = %shared.target_address, error = %e, "send failed; remote closed");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    poll_interval: Duration,
) -> Result<(), TransportError> {
    loop {
        match can_write(writer.as_ref(), poll_interval).await {
            Readiness::Ready => break,
            Readiness::Idle => continue,
            Readiness::Closed => {
                return Err(TransportError::SendFailed(std::io::ErrorKind::BrokenPipe.into()));
            }
        }
    }
    writer
        .write_all(frame)
        .await
        .map_err(TransportError::SendFailed)
}

async fn recv_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    config: ConnectionConfig,
    ready: ReadySignal,
) {
    let _close = CloseOnExit(Arc::clone(&shared));
    let mut state = shared.state.subscribe();
    ready.notify();

    loop {
        if state.borrow_and_update().is_closing() {
            break;
        }
        match can_read(reader.as_ref(), config.poll_interval).await {
            Readiness::Idle => continue,
            Readiness::Closed => break,
            Readiness::Ready => {}
        }

        let frame = tokio::select! {
            _ = wait_closing(&mut state) => break,
            frame = read_frame(&mut reader, config.max_payload_size) => frame,
        };
        match frame {
            Ok(Some(message)) => shared.deliver(message),
            Ok(None) => {
                tracing::debug!(target = %shared.target_address, "peer closed the connection");
                break;
            }
            Err(TransportError::Protocol(e)) => {
                tracing::warn!(target = %shared.target_address, error = %e, "dropping connection: bad frame");
                break;
            }
            Err(e) => {
                tracing::debug!(target = %shared.target_address, error = %e, "receive failed; remote closed");
                break;
            }
        }
    }
}

/// Reads one header and the payload it announces. `Ok(None)` on a clean
/// EOF between frames.
async fn read_frame(
    reader: &mut OwnedReadHalf,
    max_payload_size: u32,
) -> Result<Option<Message>, TransportError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TransportError::ReceiveFailed(e)),
    }
    let header = IncomingRequest::from_bytes(header).check_limit(max_payload_size)?;

    let mut payload = vec![0u8; header.payload_len()];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(TransportError::ReceiveFailed)?;

    let message: Message = JsonCodec.decode(&payload)?;
    message.validate()?;
    Ok(Some(message))
}
