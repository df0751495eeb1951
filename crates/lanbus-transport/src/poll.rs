//! Bounded readiness checks on TCP sockets.
//!
//! Connection loops never park on a socket indefinitely. Each turn asks
//! "is there something to do within `poll_interval`?" and, when the answer
//! is no, goes back to check whether the connection is shutting down.

use std::time::Duration;

use tokio::io::Interest;
use tokio::net::TcpStream;

/// Result of one readiness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// The socket can make progress now. For reads this includes a peer
    /// that has closed its end, so a final frame sent just before EOF is
    /// still picked up.
    Ready,
    /// Nothing happened within the timeout.
    Idle,
    /// The socket reported an error.
    Closed,
}

/// Waits up to `timeout` for `stream` to become readable.
pub async fn can_read(stream: &TcpStream, timeout: Duration) -> Readiness {
    wait(stream, Interest::READABLE, timeout).await
}

/// Waits up to `timeout` for `stream` to become writable.
pub async fn can_write(stream: &TcpStream, timeout: Duration) -> Readiness {
    wait(stream, Interest::WRITABLE, timeout).await
}

async fn wait(stream: &TcpStream, interest: Interest, timeout: Duration) -> Readiness {
    match tokio::time::timeout(timeout, stream.ready(interest)).await {
        Err(_elapsed) => Readiness::Idle,
        Ok(Err(e)) => {
            tracing::debug!(error = %e, "socket readiness check failed");
            Readiness::Closed
        }
        Ok(Ok(ready)) => {
            if ready.is_readable() || ready.is_writable() || ready.is_read_closed() {
                Readiness::Ready
            } else if ready.is_write_closed() {
                Readiness::Closed
            } else {
                Readiness::Idle
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    use super::*;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_can_read_idle_without_data() {
        let (a, _b) = pair().await;
        let result = can_read(&a, Duration::from_millis(30)).await;
        assert_eq!(result, Readiness::Idle);
    }

    #[tokio::test]
    async fn test_can_read_ready_after_peer_writes() {
        let (a, mut b) = pair().await;
        b.write_all(b"ping").await.unwrap();
        let result = can_read(&a, Duration::from_secs(1)).await;
        assert_eq!(result, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_can_read_ready_after_peer_closes() {
        let (a, b) = pair().await;
        drop(b);
        let result = can_read(&a, Duration::from_secs(1)).await;
        assert_eq!(result, Readiness::Ready);
    }

    #[tokio::test]
    async fn test_can_write_ready_on_fresh_socket() {
        let (a, _b) = pair().await;
        let result = can_write(&a, Duration::from_secs(1)).await;
        assert_eq!(result, Readiness::Ready);
    }
}
