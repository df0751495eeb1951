//! The connection manager: every open connection of one bus, and the
//! identity handshake that makes them addressable.
//!
//! Two indices are kept in sync under one lock:
//!
//! - `by_target_address`: every connection, from the moment it opens.
//! - `by_identified_uuid`: only connections whose peer has identified
//!   itself.
//!
//! Dropping the last handle to a [`Connection`] notifies the bus, which
//! takes this lock. Removed connections are therefore always handed back
//! to the caller and dropped after the lock is released, never inside it.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use lanbus_protocol::{IdentifyRequest, Message, PeerId};
use lanbus_transport::{Connection, ConnectionConfig, ConnectionHandler};
use tokio::net::TcpStream;

use crate::requests::{Outcome, RequestManager};
use crate::BusError;

/// Where a new connection comes from.
#[derive(Debug)]
pub enum Endpoint {
    /// Dial out to this address.
    Connect(SocketAddr),
    /// A socket the host's listener accepted.
    Accepted(TcpStream),
}

#[derive(Default)]
struct Indices {
    by_target_address: HashMap<SocketAddr, Arc<Connection>>,
    by_identified_uuid: HashMap<PeerId, SocketAddr>,
}

pub struct ConnectionManager {
    local_uuid: PeerId,
    config: ConnectionConfig,
    indices: Mutex<Indices>,
}

impl ConnectionManager {
    pub fn new(local_uuid: PeerId, config: ConnectionConfig) -> Self {
        Self {
            local_uuid,
            config,
            indices: Mutex::new(Indices::default()),
        }
    }

    pub fn local_uuid(&self) -> PeerId {
        self.local_uuid
    }

    /// Opens (or adopts) a connection, registers it by address and starts
    /// its loops.
    ///
    /// Registration happens before the loops start, so the peer's
    /// `IdentifyRequest` always finds the connection.
    pub async fn open(
        &self,
        endpoint: Endpoint,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Result<Arc<Connection>, BusError> {
        let conn = match endpoint {
            Endpoint::Connect(addr) => {
                Connection::connect(addr, self.local_uuid, handler, self.config).await?
            }
            Endpoint::Accepted(stream) => {
                Connection::from_stream(stream, self.local_uuid, handler, self.config)?
            }
        };
        let conn = Arc::new(conn);
        let target = conn.target_address();

        // A leftover entry means the old socket died and the peer reused its
        // port. Close it before the new one takes the address.
        if let Some(stale) = self.remove(target) {
            tracing::warn!(%target, "replacing stale connection to the same address");
            stale.close().await;
        }
        let raced = self
            .lock()
            .by_target_address
            .insert(target, Arc::clone(&conn));
        if let Some(raced) = raced {
            raced.close().await;
        }

        if let Err(e) = conn.start().await {
            let _removed = self.remove(target);
            conn.close().await;
            return Err(e.into());
        }
        Ok(conn)
    }

    /// Performs the identity handshake on a freshly opened connection.
    ///
    /// Sends this bus's `IdentifyRequest` and waits for both halves of the
    /// exchange: the peer acknowledging ours, and the peer's own
    /// `IdentifyRequest` arriving. If the connection closes first (or the
    /// bus stops), the wait ends with [`BusError::HandshakeFailed`].
    pub async fn handshake(
        &self,
        conn: &Connection,
        requests: &RequestManager,
    ) -> Result<PeerId, BusError> {
        let addr = conn.target_address();
        let failed = |reason: &str| BusError::HandshakeFailed {
            addr,
            reason: reason.to_string(),
        };

        let identify = Message::from(IdentifyRequest {
            client_id: self.local_uuid,
            source_address: conn.source_address(),
        });
        let ticket = requests.register(identify.id, [addr]);
        if conn.enqueue(identify.clone()).is_err() {
            requests.resolve(identify.id, addr, Outcome::Disconnected);
        }
        tracing::debug!(%addr, "identify sent, awaiting acknowledgement");

        let report = ticket.wait().await;
        if let Some((_, reason)) = report.failed.first() {
            return Err(failed(reason));
        }
        if report.acknowledged.is_empty() {
            return Err(failed("connection closed before identify was acknowledged"));
        }

        conn.wait_identified()
            .await
            .ok_or_else(|| failed("connection closed before the peer identified itself"))
    }

    /// Binds `target`'s connection to `peer_id`. Called when that
    /// connection delivers an `IdentifyRequest`.
    pub fn identify(&self, target: SocketAddr, peer_id: PeerId) -> Result<(), BusError> {
        let mut indices = self.lock();
        let conn = indices
            .by_target_address
            .get(&target)
            .ok_or(BusError::PeerNotFound(target))?;
        conn.identify(peer_id)?;

        if let Some(previous) = indices.by_identified_uuid.insert(peer_id, target) {
            tracing::warn!(%peer_id, %previous, %target, "peer identified on a second connection");
        }
        Ok(())
    }

    /// Any open connection to `addr`, identified or not.
    pub fn get(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.lock().by_target_address.get(&addr).cloned()
    }

    /// The connection to `addr`, if its peer has identified itself.
    pub fn identified(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.get(addr).filter(|conn| conn.remote_uuid().is_some())
    }

    /// The connection whose peer identified itself as `peer_id`.
    pub fn by_uuid(&self, peer_id: PeerId) -> Option<Arc<Connection>> {
        let indices = self.lock();
        let addr = indices.by_identified_uuid.get(&peer_id)?;
        indices.by_target_address.get(addr).cloned()
    }

    pub fn identified_connections(&self) -> Vec<Arc<Connection>> {
        self.lock()
            .by_target_address
            .values()
            .filter(|conn| conn.remote_uuid().is_some())
            .cloned()
            .collect()
    }

    /// Identified peers and the address each is connected from.
    pub fn peers(&self) -> Vec<(PeerId, SocketAddr)> {
        let mut peers: Vec<_> = self
            .lock()
            .by_identified_uuid
            .iter()
            .map(|(peer_id, addr)| (*peer_id, *addr))
            .collect();
        peers.sort_by_key(|(_, addr)| *addr);
        peers
    }

    /// Removes `addr`'s connection from both indices and hands it back.
    #[must_use = "drop the removed connection outside any lock, or close it"]
    pub fn remove(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        let mut indices = self.lock();
        let removed = indices.by_target_address.remove(&addr)?;
        if let Some(peer_id) = removed.remote_uuid() {
            if indices.by_identified_uuid.get(&peer_id) == Some(&addr) {
                indices.by_identified_uuid.remove(&peer_id);
            }
        }
        Some(removed)
    }

    /// Like [`remove`](Self::remove), but only if the connection at `addr`
    /// is already closing. A closing connection reports by address, and a
    /// fresh connection may have taken that address in the meantime.
    #[must_use = "drop the removed connection outside any lock, or close it"]
    pub fn remove_closing(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        let closing = self
            .lock()
            .by_target_address
            .get(&addr)
            .is_some_and(|conn| conn.state().is_closing());
        if closing {
            self.remove(addr)
        } else {
            None
        }
    }

    /// Removes and returns every connection.
    pub fn drain(&self) -> Vec<Arc<Connection>> {
        let mut indices = self.lock();
        indices.by_identified_uuid.clear();
        indices.by_target_address.drain().map(|(_, conn)| conn).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().by_target_address.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Indices> {
        self.indices.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
