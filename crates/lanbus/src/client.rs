//! The client side of the bus.
//!
//! A client has one peer, the host. `start` dials it and doesn't return
//! until the identity handshake has gone both ways, so the first `send`
//! after `start` always has somewhere to go. If the host goes away the
//! connection is dropped from the bus; sends then report no targets until
//! the bus is stopped and started again.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use lanbus_protocol::{Message, MessageType, PeerId};

use crate::connections::Endpoint;
use crate::networked::NetworkedCore;
use crate::{BusConfig, BusError, DeliveryReport, HandlerResult, MessageBus, Origin};

/// A bus with exactly one connection: to the host.
///
/// ```rust,no_run
/// use lanbus::prelude::*;
///
/// # async fn run() -> Result<(), BusError> {
/// let bus = ClientMessageBus::new(PeerId::random(), BusConfig::default());
/// bus.start("192.168.1.10:40000".parse().unwrap()).await?;
///
/// let report = bus.send(PrintRequest::new("hello").into(), None, true).await?;
/// assert!(report.all_acknowledged());
/// bus.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ClientMessageBus {
    core: Arc<NetworkedCore>,
    host_address: Mutex<Option<SocketAddr>>,
}

impl ClientMessageBus {
    pub fn new(owner_id: PeerId, config: BusConfig) -> Self {
        Self {
            core: NetworkedCore::new(owner_id, config),
            host_address: Mutex::new(None),
        }
    }

    pub fn local_uuid(&self) -> PeerId {
        self.core.local_uuid()
    }

    pub fn is_running(&self) -> bool {
        self.core.is_running()
    }

    /// The host this bus was last started against.
    pub fn host_address(&self) -> Option<SocketAddr> {
        *self.host_address.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Identified peers; at most the host.
    pub fn peers(&self) -> Vec<(PeerId, SocketAddr)> {
        self.core.connections.peers()
    }
}

impl MessageBus for ClientMessageBus {
    type Endpoint = SocketAddr;

    /// Connects to the host and completes the handshake before returning.
    async fn start(&self, host_address: SocketAddr) -> Result<(), BusError> {
        self.core.begin_start()?;
        match self.core.connect(Endpoint::Connect(host_address)).await {
            Ok(conn) => {
                *self.host_address.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(host_address);
                tracing::info!(
                    peer_id = %self.local_uuid(),
                    host = %host_address,
                    local = %conn.source_address(),
                    "client bus started"
                );
                Ok(())
            }
            Err(e) => {
                self.core.abort_start();
                Err(e)
            }
        }
    }

    async fn stop(&self) {
        self.core.stop().await;
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

impl Drop for ClientMessageBus {
    fn drop(&mut self) {
        self.core.abandon();
    }
}
