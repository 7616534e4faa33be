//! Endpoint configuration.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::engine::arq::ArqConfig;
use crate::engine::EngineOptions;

/// What a connection does when the engine accepts zero bytes while the
/// connection is believed writable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WriteStallPolicy {
    /// Keep the unaccepted bytes queued and offer them again on the next
    /// WRITABLE notification.
    #[default]
    Wait,
    /// Treat the stall as fatal: record [`crate::Error::WriteStalled`] and
    /// close the connection.
    Close,
}

/// Per-endpoint settings.  One endpoint owns one UDP socket and one engine.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// Local address of the UDP socket.  Port 0 picks an ephemeral port.
    pub bind_addr: SocketAddr,
    /// Cadence of `check_timeouts`.
    pub tick_interval: Duration,
    /// Receive buffer size; longer datagrams are truncated by the OS.
    pub max_datagram: usize,
    pub write_stall: WriteStallPolicy,
    /// Handed to the engine at context-init.
    pub engine: EngineOptions,
    /// Used when the endpoint builds its own [`crate::ArqEngine`].
    pub arq: ArqConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            tick_interval: Duration::from_millis(500),
            max_datagram: 65_535,
            write_stall: WriteStallPolicy::Wait,
            engine: EngineOptions::default(),
            arq: ArqConfig::default(),
        }
    }
}

impl EndpointConfig {
    /// Default settings bound to `addr`.
    pub fn bound_to(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Self::default()
        }
    }
}
