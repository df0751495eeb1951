//! Bus configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use lanbus_transport::ConnectionConfig;
use serde::{Deserialize, Serialize};

/// Port a host listens on unless told otherwise.
pub const DEFAULT_PORT: u16 = 40000;

const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(1);
const MIN_PAYLOAD_SIZE: u32 = 1024;

/// Settings shared by every bus variant.
///
/// Bus constructors run [`validated`](Self::validated) on whatever they are
/// given, so out-of-range values are clamped rather than rejected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Where a host bus listens. Port 0 picks an ephemeral port.
    pub listen_address: SocketAddr,

    /// How long any loop waits on a socket before rechecking whether it
    /// should stop. Bounds how quickly `stop` takes effect.
    pub poll_interval: Duration,

    /// Largest payload a receiver accepts. A frame announcing more closes
    /// the connection.
    pub max_payload_size: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            poll_interval: Duration::from_millis(100),
            max_payload_size: 16 * 1024 * 1024,
        }
    }
}

impl BusConfig {
    /// Default settings listening on `port` on all interfaces.
    pub fn with_port(port: u16) -> Self {
        Self {
            listen_address: SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
            ..Self::default()
        }
    }

    /// Clamps every field into its supported range.
    pub fn validated(mut self) -> Self {
        let poll = self.poll_interval.clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        if poll != self.poll_interval {
            tracing::warn!(
                requested = ?self.poll_interval,
                using = ?poll,
                "poll_interval out of range, clamping"
            );
            self.poll_interval = poll;
        }
        if self.max_payload_size < MIN_PAYLOAD_SIZE {
            tracing::warn!(
                requested = self.max_payload_size,
                using = MIN_PAYLOAD_SIZE,
                "max_payload_size too small, clamping"
            );
            self.max_payload_size = MIN_PAYLOAD_SIZE;
        }
        self
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            poll_interval: self.poll_interval,
            max_payload_size: self.max_payload_size,
        }
    }
}
