//! Error taxonomy.
//!
//! | Type              | Raised by                               | Delivery        |
//! |-------------------|-----------------------------------------|-----------------|
//! | [`EngineError`]   | an engine call rejecting its arguments  | synchronous     |
//! | [`TransportError`]| the engine's error callback             | `connection_lost` |
//! | [`Error::Socket`] | the OS UDP socket (not would-block)     | every connection, fatal |
//! | [`Error::ProtocolViolation`] | an impossible callback sequence | logged + `wait_closed` |
//!
//! [`Error`] is `Clone` so the single terminal error of a connection can be
//! handed to the protocol handler and to every `wait_closed` waiter.

use std::io;
use std::sync::Arc;

use thiserror::Error;

use crate::engine::SocketHandle;

/// Immediate rejection of an imperative engine call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("unknown socket handle {0}")]
    UnknownHandle(SocketHandle),
    #[error("socket {0} is already connected")]
    AlreadyConnected(SocketHandle),
    #[error("engine context destroyed")]
    Destroyed,
}

/// Asynchronous error code reported through the engine's error callback.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection refused")]
    ConnectionRefused,
    #[error("connection reset")]
    ConnectionReset,
    #[error("connection timed out")]
    TimedOut,
}

/// Crate-level error.
#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The context's UDP socket failed; fatal for every connection on it.
    #[error("socket error: {0}")]
    Socket(Arc<io::Error>),

    #[error("failed to bind UDP socket: {0}")]
    Bind(Arc<io::Error>),

    /// The engine produced a callback sequence the state machine cannot explain.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("connection closing")]
    Closing,

    #[error("connection closed")]
    Closed,

    /// The engine stopped accepting bytes on a connection believed writable.
    #[error("engine stopped accepting writes")]
    WriteStalled,

    #[error("reading already paused")]
    AlreadyPaused,

    #[error("reading not paused")]
    NotPaused,

    /// The endpoint task is gone; no further operations are possible.
    #[error("endpoint task has terminated")]
    EndpointGone,
}

impl Error {
    pub(crate) fn socket(e: io::Error) -> Self {
        Self::Socket(Arc::new(e))
    }

    pub(crate) fn bind(e: io::Error) -> Self {
        Self::Bind(Arc::new(e))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_error_converts() {
        let e: Error = EngineError::Destroyed.into();
        assert!(matches!(e, Error::Engine(EngineError::Destroyed)));
    }

    #[test]
    fn socket_error_is_cloneable() {
        let e = Error::socket(io::Error::new(io::ErrorKind::Other, "boom"));
        let c = e.clone();
        assert_eq!(e.to_string(), c.to_string());
        assert!(c.to_string().contains("boom"));
    }

    #[test]
    fn transport_error_display() {
        let e: Error = TransportError::ConnectionReset.into();
        assert_eq!(e.to_string(), "transport error: connection reset");
    }
}
