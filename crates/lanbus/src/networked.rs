//! State and behaviour shared by the client and host buses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lanbus_protocol::{Message, Payload, PeerId};
use lanbus_transport::{Connection, ConnectionHandler};

use crate::connections::{ConnectionManager, Endpoint};
use crate::registry::{HandlerRegistry, Origin};
use crate::requests::{DeliveryReport, Outcome, RequestManager};
use crate::{BusConfig, BusError};

pub(crate) struct NetworkedCore {
    pub(crate) config: BusConfig,
    pub(crate) connections: ConnectionManager,
    pub(crate) requests: RequestManager,
    pub(crate) registry: HandlerRegistry,
    running: AtomicBool,
}

impl NetworkedCore {
    pub(crate) fn new(local_uuid: PeerId, config: BusConfig) -> Arc<Self> {
        let config = config.validated();
        Arc::new(Self {
            connections: ConnectionManager::new(local_uuid, config.connection_config()),
            requests: RequestManager::new(),
            registry: HandlerRegistry::new(),
            running: AtomicBool::new(false),
            config,
        })
    }

    pub(crate) fn local_uuid(&self) -> PeerId {
        self.connections.local_uuid()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flips the bus to running.
    ///
    /// # Errors
    /// [`BusError::AlreadyRunning`] if it already was.
    pub(crate) fn begin_start(&self) -> Result<(), BusError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| BusError::AlreadyRunning)?;
        self.requests.reopen();
        Ok(())
    }

    /// Undoes [`begin_start`](Self::begin_start) after a failed start.
    pub(crate) fn abort_start(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Opens a connection and runs the identity handshake on it. On failure
    /// the connection is closed and forgotten.
    pub(crate) async fn connect(
        self: &Arc<Self>,
        endpoint: Endpoint,
    ) -> Result<Arc<Connection>, BusError> {
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(self) as Arc<dyn ConnectionHandler>;
        let conn = self.connections.open(endpoint, handler).await?;
        let addr = conn.target_address();

        match self.connections.handshake(&conn, &self.requests).await {
            Ok(peer_id) => {
                tracing::info!(%peer_id, %addr, "peer identified");
                Ok(conn)
            }
            Err(e) => {
                let _removed = self.connections.remove(addr);
                conn.close().await;
                Err(e)
            }
        }
    }

    /// Queues `message` on the resolved targets and, for blocking requests,
    /// waits until each has answered or disconnected.
    pub(crate) async fn send(
        &self,
        message: Message,
        target: Option<SocketAddr>,
        blocking: bool,
    ) -> Result<DeliveryReport, BusError> {
        if !self.is_running() {
            return Err(BusError::NotRunning);
        }

        let targets = match target {
            Some(addr) => vec![
                self.connections
                    .identified(addr)
                    .ok_or(BusError::PeerNotFound(addr))?,
            ],
            None => self.connections.identified_connections(),
        };

        // Only requests are ever answered.
        let blocking = blocking && message.requires_response();
        let ticket = blocking.then(|| {
            self.requests
                .register(message.id, targets.iter().map(|conn| conn.target_address()))
        });

        tracing::trace!(
            id = %message.id,
            kind = %message.message_type(),
            targets = targets.len(),
            blocking,
            "sending"
        );
        for conn in &targets {
            if let Err(e) = conn.enqueue(message.clone()) {
                tracing::debug!(target = %conn.target_address(), error = %e, "target unavailable");
                if blocking {
                    self.requests
                        .resolve(message.id, conn.target_address(), Outcome::Disconnected);
                }
            }
        }

        match ticket {
            Some(ticket) => Ok(ticket.wait().await),
            None => Ok(DeliveryReport::default()),
        }
    }

    /// Releases every blocked sender, then closes every connection.
    pub(crate) async fn stop(&self) {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.requests.release_all();
        let connections = self.connections.drain();
        for conn in connections {
            conn.close().await;
        }
        if was_running {
            tracing::info!(peer_id = %self.local_uuid(), "bus stopped");
        }
    }

    /// Synchronous teardown for `Drop`: releases senders and tells every
    /// connection to close without waiting for its loops.
    pub(crate) fn abandon(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.requests.release_all();
        drop(self.connections.drain());
    }
}

impl ConnectionHandler for NetworkedCore {
    fn on_message(&self, from: SocketAddr, message: &Message) -> Result<(), String> {
        match &message.payload {
            Payload::Identify(identify) => {
                if identify.source_address != from {
                    tracing::debug!(
                        %from,
                        claimed = %identify.source_address,
                        "peer sees its own address differently"
                    );
                }
                self.connections
                    .identify(from, identify.client_id)
                    .map_err(|e| e.to_string())?;
            }
            Payload::Success(success) => {
                self.requests
                    .resolve(success.request_id, from, Outcome::Acknowledged);
            }
            Payload::Fail(fail) => {
                self.requests
                    .resolve(fail.request_id, from, Outcome::Failed(fail.error.clone()));
            }
            Payload::Print(print) => {
                tracing::info!(%from, text = %print.text, "print request");
            }
            Payload::Game(_) => {}
        }
        self.registry.dispatch(message, Origin::Peer(from))
    }

    fn on_closed(&self, target: SocketAddr) {
        self.requests.connection_closed(target);
        let Some(conn) = self.connections.remove_closing(target) else {
            return;
        };
        match conn.remote_uuid() {
            Some(peer_id) => tracing::info!(%peer_id, %target, "peer disconnected"),
            None => tracing::debug!(%target, "unidentified connection closed"),
        }
        // Joining the loops has to happen off the loop that is reporting.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { conn.close().await });
        }
    }
}
