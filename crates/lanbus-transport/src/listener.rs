use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use crate::TransportError;

/// A bound TCP listener whose accepts give up after a timeout, so an accept
/// loop gets regular chances to notice it should stop.
pub struct Listener {
    inner: TcpListener,
}

impl Listener {
    /// Binds to `addr`. Port 0 picks an ephemeral port; see
    /// [`Listener::local_addr`].
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr)
            .await
            .map_err(TransportError::BindFailed)?;
        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.inner.local_addr().map_err(TransportError::SocketInfo)
    }

    /// Accepts one connection, or returns `Ok(None)` if none arrived within
    /// `timeout`.
    pub async fn accept_timeout(
        &self,
        timeout: Duration,
    ) -> Result<Option<(TcpStream, SocketAddr)>, TransportError> {
        match tokio::time::timeout(timeout, self.inner.accept()).await {
            Err(_elapsed) => Ok(None),
            Ok(Ok(accepted)) => Ok(Some(accepted)),
            Ok(Err(e)) => Err(TransportError::AcceptFailed(e)),
        }
    }
}
