//! Address codec.
//!
//! Converts between the generic `(host, port)` pair applications speak and
//! the engine's native address type ([`SocketAddr`]).  Pure and stateless:
//! no name resolution happens here, so `host` must be an IP literal.

use std::net::{IpAddr, SocketAddr};

use crate::error::EngineError;

/// Generic endpoint address as seen by applications.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeerName {
    pub host: String,
    pub port: u16,
}

impl std::fmt::Display for PeerName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Encode `(host, port)` into the engine's native address.
///
/// Port 0 is rejected: the engine cannot send to it.
pub fn to_native(host: &str, port: u16) -> Result<SocketAddr, EngineError> {
    let trimmed = host.trim_start_matches('[').trim_end_matches(']');
    let ip: IpAddr = trimmed
        .parse()
        .map_err(|_| EngineError::InvalidAddress(format!("{host}:{port}")))?;
    if port == 0 {
        return Err(EngineError::InvalidAddress(format!("{host}:{port}")));
    }
    Ok(SocketAddr::new(ip, port))
}

/// Decode a native address back into its generic form.
pub fn from_native(addr: SocketAddr) -> PeerName {
    PeerName {
        host: addr.ip().to_string(),
        port: addr.port(),
    }
}
