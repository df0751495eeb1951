//! The host side of the bus.
//!
//! ```text
//!  accept-{addr} worker            one task per accepted socket
//! ┌──────────────────────┐ spawn  ┌──────────────────────────────┐
//! │ Listener::accept     │──────► │ open + identify handshake    │
//! │ (polled, sees stop)  │        │ (registered, or dropped)     │
//! └──────────────────────┘        └──────────────────────────────┘
//! ```
//!
//! The accept loop never waits on a peer. Each accepted socket is
//! handshaken on its own task, so a client that connects and stays silent
//! holds up nobody but itself. Those tasks live in a [`JoinSet`] owned by
//! the accept loop; the loop joins them on its way out, and `stop()` joins
//! the loop after releasing every pending handshake.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use lanbus_protocol::{Message, MessageType, PeerId};
use lanbus_transport::{Listener, ReadySignal, Worker};
use tokio::task::JoinSet;

use crate::connections::Endpoint;
use crate::networked::NetworkedCore;
use crate::{BusConfig, BusError, DeliveryReport, HandlerResult, MessageBus, Origin};

/// A bus that listens for clients and keeps one connection per client.
///
/// Each accepted socket goes through the same identity handshake a client
/// performs on start, so both ends know each other's [`PeerId`] before
/// either can address the other.
pub struct HostMessageBus {
    core: Arc<NetworkedCore>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_worker: tokio::sync::Mutex<Option<Worker>>,
}

impl HostMessageBus {
    pub fn new(owner_id: PeerId, config: BusConfig) -> Self {
        Self {
            core: NetworkedCore::new(owner_id, config),
            local_addr: Mutex::new(None),
            accept_worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn local_uuid(&self) -> PeerId {
        self.core.local_uuid()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// Address the listener is bound to while running. With port 0 in the
    /// config, this is where the ephemeral port shows up.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identified clients, ordered by address.
    pub fn peers(&self) -> Vec<(PeerId, SocketAddr)> {
        self.core.connections.peers()
    }
}

impl MessageBus for HostMessageBus {
    type Endpoint = ();

    /// Binds the listener and starts accepting. Returns once the accept
    /// loop is polling.
    async fn start(&self, _endpoint: ()) -> Result<(), BusError> {
        self.core.begin_start()?;

        let listener = match Listener::bind(self.core.config.listen_address).await {
            Ok(listener) => listener,
            Err(e) => {
                self.core.abort_start();
                return Err(e.into());
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                self.core.abort_start();
                return Err(e.into());
            }
        };

        let core = Arc::clone(&self.core);
        let worker = Worker::spawn(format!("accept-{addr}"), move |ready| {
            accept_loop(core, listener, ready)
        })
        .await_ready()
        .await;
        let worker = match worker {
            Ok(worker) => worker,
            Err(e) => {
                self.core.abort_start();
                return Err(e.into());
            }
        };

        *self.accept_worker.lock().await = Some(worker);
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = Some(addr);
        tracing::info!(peer_id = %self.local_uuid(), %addr, "host bus listening");
        Ok(())
    }

    async fn stop(&self) {
        // Releases pending handshakes so the accept loop can join them.
        self.core.stop().await;
        let worker = self.accept_worker.lock().await.take();
        if let Some(worker) = worker {
            worker.join().await;
        }
        // Anything accepted between the first pass and the join.
        self.core.stop().await;
        *self.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    async fn send(
        &self,
        message: Message,
        target: Option<SocketAddr>,
        blocking: bool,
    ) -> Result<DeliveryReport, BusError> {
        self.core.send(message, target, blocking).await
    }

    fn register_data_handler<F>(&self, message_type: MessageType, handler: F)
    where
        F: Fn(&Message, Origin) -> HandlerResult + Send + Sync + 'static,
    {
        self.core.registry.register(message_type, handler);
    }
}

impl Drop for HostMessageBus {
    fn drop(&mut self) {
        // The accept loop sees the flag within one poll interval and exits.
        self.core.abandon();
    }
}

async fn accept_loop(core: Arc<NetworkedCore>, listener: Listener, ready: ReadySignal) {
    let poll_interval = core.config.poll_interval;
    let mut handshakes = JoinSet::new();
    ready.notify();

    while core.is_running() {
        while handshakes.try_join_next().is_some() {}

        match listener.accept_timeout(poll_interval).await {
            Ok(None) => continue,
            Ok(Some((stream, addr))) => {
                tracing::debug!(%addr, "accepted connection");
                let core = Arc::clone(&core);
                handshakes.spawn(async move {
                    if let Err(e) = core.connect(Endpoint::Accepted(stream)).await {
                        tracing::warn!(%addr, error = %e, "inbound connection dropped");
                    }
                });
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(poll_interval).await;
            }
        }
    }

    if !handshakes.is_empty() {
        tracing::debug!(pending = handshakes.len(), "waiting for inbound handshakes");
    }
    while handshakes.join_next().await.is_some() {}
    tracing::debug!("accept loop exited");
}
