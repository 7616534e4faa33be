//! Engine binding: the capability interface of the transport-protocol engine.
//!
//! The engine (sequencing, congestion control, retransmission, ACKs) is a
//! black box.  The adapter drives it through the imperative calls of
//! [`Engine`] and hears back exclusively through [`EngineCallbacks`]:
//!
//! ```text
//!           imperative calls                      callbacks
//!  adapter ───────────────────▶  Engine  ─────────────────────▶ adapter
//!   create_socket / connect          │    on_sendto / on_state_change
//!   write / read_drained / close     │    on_error / on_read
//!   process_datagram                 │    on_firewall / on_accept
//!   issue_deferred_acks              │    on_log
//!   check_timeouts / destroy         ▼
//! ```
//!
//! Every call that takes a `cb` argument may fire any number of callbacks
//! **synchronously** before it returns.  Implementations differ only in how
//! the foreign call boundary is crossed; [`arq::ArqEngine`] is the in-crate
//! reference implementation.

pub mod arq;

use std::net::SocketAddr;

use crate::error::EngineError;

/// Opaque, engine-assigned identifier of one logical connection.
///
/// Unique within its engine while the connection is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SocketHandle(pub u32);

impl std::fmt::Display for SocketHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// State transitions reported by [`EngineCallbacks::on_state_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Outbound connect completed.
    Connect,
    /// The socket can accept writes again.
    Writable,
    /// The peer finished sending.
    Eof,
    /// Terminal; the handle is invalid once the callback returns.
    Destroying,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "CONNECT",
            Self::Writable => "WRITABLE",
            Self::Eof => "EOF",
            Self::Destroying => "DESTROYING",
        };
        f.write_str(s)
    }
}

/// Context-init options handed to an engine constructor.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Forward the engine's normal log lines.
    pub log_normal: bool,
    /// Forward the engine's debug log lines.
    pub log_debug: bool,
    /// Forward segment sizing (path MTU) log lines.
    pub log_mtu: bool,
    /// Bytes the engine accepts from `write` before reporting backpressure.
    pub send_buffer: usize,
    /// Bytes of unread inbound data before the engine closes its window.
    pub recv_buffer: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            log_normal: false,
            log_debug: false,
            log_mtu: false,
            send_buffer: 64 * 1024,
            recv_buffer: 64 * 1024,
        }
    }
}

impl EngineOptions {
    /// Options with every log switch on.
    pub fn debug() -> Self {
        Self {
            log_normal: true,
            log_debug: true,
            log_mtu: true,
            ..Self::default()
        }
    }
}

/// Callback registrations, implemented by the adapter.
pub trait EngineCallbacks {
    /// A datagram is ready for the wire.  `handle` is `None` for datagrams
    /// not tied to a live socket (e.g. resets for unknown connections).
    fn on_sendto(&mut self, handle: Option<SocketHandle>, datagram: &[u8], to: SocketAddr);

    fn on_state_change(&mut self, handle: SocketHandle, state: EngineState);

    fn on_error(&mut self, handle: SocketHandle, error: crate::error::TransportError);

    /// In-order payload.  The adapter must later call
    /// [`Engine::read_drained`] for `handle`.
    fn on_read(&mut self, handle: SocketHandle, data: &[u8]);

    /// Accept gate, offered before a handle exists.  `true` admits.
    fn on_firewall(&mut self, from: SocketAddr) -> bool;

    /// A new inbound connection was admitted.  The adapter must register it
    /// before returning; more callbacks for `handle` may follow in the same
    /// engine call.
    fn on_accept(&mut self, handle: SocketHandle, from: SocketAddr);

    fn on_log(&mut self, handle: Option<SocketHandle>, message: &str);
}

/// Imperative engine calls.
///
/// Context-init is the implementation's constructor (see
/// [`arq::ArqEngine::new`]).  No call is valid after [`Engine::destroy`].
pub trait Engine: Send {
    fn create_socket(&mut self) -> SocketHandle;

    /// Start connecting `handle` to `to`.  Completion is signalled later by
    /// [`EngineState::Connect`], never by the return value.
    fn connect(
        &mut self,
        handle: SocketHandle,
        to: SocketAddr,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError>;

    /// Offer `data`; returns how many leading bytes were accepted (possibly 0).
    fn write(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
        cb: &mut dyn EngineCallbacks,
    ) -> Result<usize, EngineError>;

    fn read_drained(&mut self, handle: SocketHandle);

    /// Request teardown.  Completion is a later [`EngineState::Destroying`].
    fn close(&mut self, handle: SocketHandle, cb: &mut dyn EngineCallbacks);

    /// Feed one inbound UDP payload.  Returns `false` if the datagram was not
    /// recognised by the engine.
    fn process_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        cb: &mut dyn EngineCallbacks,
    ) -> bool;

    /// Flush acknowledgements batched during the last drain cycle.
    fn issue_deferred_acks(&mut self, cb: &mut dyn EngineCallbacks);

    /// Drive retransmission and keepalive; called at a fixed cadence.
    fn check_timeouts(&mut self, cb: &mut dyn EngineCallbacks);

    /// Release everything.  Only after every handle reached `Destroying`.
    fn destroy(&mut self);
}
