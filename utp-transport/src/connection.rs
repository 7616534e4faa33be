//! Logical connections.
//!
//! A connection is one stream bound to one engine handle and one UDP peer.
//! Its state lives in a [`ConnectionSlot`] inside the endpoint task; the
//! application reaches it through:
//!
//! - [`Connection`], a cloneable handle usable from any task, and
//! - [`ConnectionRef`], the borrowed view handed to [`Protocol`] callbacks.
//!
//! # Write path
//!
//! ```text
//!  write(data) ──▶ pending queue ──(writable?)──▶ engine.write
//!                        ▲                            │
//!                        └──── unaccepted suffix ─────┘
//! ```
//!
//! Bytes leave the pending queue strictly in order.  When the engine accepts
//! nothing, the connection stops offering until the next WRITABLE (or closes,
//! per [`WriteStallPolicy`]).  A close requested with bytes still queued is
//! issued to the engine once the queue has drained.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::sync::{mpsc, oneshot, watch};

use crate::addr::{self, PeerName};
use crate::config::{EndpointConfig, WriteStallPolicy};
use crate::endpoint::{ClosedRx, ClosedTx, Command, ConnId, Core, Endpoint, Role};
use crate::engine::arq::ArqEngine;
use crate::engine::{Engine, SocketHandle};
use crate::error::{Error, Result};
use crate::protocol::{ChannelProtocol, EventStream, Protocol};
use crate::socket::DatagramSocket;
use crate::state::Lifecycle;

/// Outcome of a successful write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Every byte was handed to the engine.
    Sent,
    /// Some bytes wait in the pending queue for the connection to become
    /// writable.
    Queued,
}

// ---------------------------------------------------------------------------
// ConnectionSlot
// ---------------------------------------------------------------------------

pub(crate) struct ConnectionSlot {
    pub(crate) handle: SocketHandle,
    pub(crate) peer: SocketAddr,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) pending: VecDeque<Vec<u8>>,
    /// `None` while a callback is running, and for an accepted connection
    /// until its handler is built.
    pub(crate) protocol: Option<Box<dyn Protocol>>,
    pub(crate) closed: ClosedTx,
}

impl ConnectionSlot {
    pub(crate) fn new(
        handle: SocketHandle,
        peer: SocketAddr,
        lifecycle: Lifecycle,
        protocol: Option<Box<dyn Protocol>>,
    ) -> Self {
        let (closed, _) = watch::channel(None);
        Self {
            handle,
            peer,
            lifecycle,
            pending: VecDeque::new(),
            protocol,
            closed,
        }
    }

    pub(crate) fn pending_bytes(&self) -> usize {
        self.pending.iter().map(Vec::len).sum()
    }

    /// Error policy.  Records `error` (if any), discards queued data and
    /// forces the connection closed.  Returns `true` if the engine must be
    /// told to close.
    ///
    /// Once the engine close has been issued, further errors are only logged.
    pub(crate) fn abort(&mut self, error: Option<Error>) -> bool {
        if self.lifecycle.is_destroyed() {
            return false;
        }
        let reason = error
            .as_ref()
            .map_or_else(|| "aborted".to_string(), Error::to_string);
        if self.lifecycle.closing && self.lifecycle.close_sent {
            log::debug!("[conn] {} already closing, ignoring: {reason}", self.handle);
            return false;
        }
        if !self.pending.is_empty() {
            log::warn!(
                "[conn] {} discarding {} queued bytes: {reason}",
                self.handle,
                self.pending_bytes()
            );
            self.pending.clear();
        }
        if let Some(error) = error {
            self.lifecycle.record_error(error);
        }
        self.lifecycle.closing = true;
        self.lifecycle.close_sent = true;
        true
    }
}

// ---------------------------------------------------------------------------
// Write / close paths (run on the endpoint task)
// ---------------------------------------------------------------------------

impl Core {
    pub(crate) fn write(
        &mut self,
        engine: &mut dyn Engine,
        id: ConnId,
        data: &[u8],
    ) -> Result<WriteStatus> {
        let slot = self.slots.get_mut(&id).ok_or(Error::Closed)?;
        slot.lifecycle.check_writable()?;
        if !data.is_empty() {
            slot.pending.push_back(data.to_vec());
        }
        if !slot.lifecycle.writable {
            log::debug!(
                "[conn] {} not writable, {} bytes queued",
                slot.handle,
                slot.pending_bytes()
            );
        }

        let flushed = self.flush(engine, id);
        self.settle(engine);
        flushed?;

        let queued = self
            .slots
            .get(&id)
            .map_or(false, |slot| !slot.pending.is_empty());
        Ok(if queued {
            WriteStatus::Queued
        } else {
            WriteStatus::Sent
        })
    }

    /// Offer the pending queue to the engine; issue a deferred close once it
    /// is empty.
    pub(crate) fn flush(&mut self, engine: &mut dyn Engine, id: ConnId) -> Result<()> {
        loop {
            let Some(slot) = self.slots.get_mut(&id) else {
                return Ok(());
            };
            if slot.lifecycle.is_destroyed() || !slot.lifecycle.writable {
                break;
            }
            let Some(chunk) = slot.pending.pop_front() else {
                break;
            };
            let handle = slot.handle;

            let result = engine.write(handle, &chunk, self);

            let Some(slot) = self.slots.get_mut(&id) else {
                return Ok(());
            };
            match result {
                Ok(n) if n >= chunk.len() => {}
                Ok(n) => {
                    slot.pending.push_front(chunk[n..].to_vec());
                    if n > 0 {
                        continue;
                    }
                    slot.lifecycle.writable = false;
                    match self.write_stall {
                        WriteStallPolicy::Wait => {
                            log::debug!(
                                "[conn] {handle} engine full, holding {} bytes",
                                slot.pending_bytes()
                            );
                            return Ok(());
                        }
                        WriteStallPolicy::Close => {
                            log::warn!("[conn] {handle} write stalled, closing");
                            if slot.abort(Some(Error::WriteStalled)) {
                                engine.close(handle, self);
                            }
                            return Err(Error::WriteStalled);
                        }
                    }
                }
                Err(e) => {
                    let error = Error::from(e);
                    log::warn!("[conn] {handle} engine rejected write: {error}");
                    if slot.abort(Some(error.clone())) {
                        engine.close(handle, self);
                    }
                    return Err(error);
                }
            }
        }

        if let Some(slot) = self.slots.get_mut(&id) {
            let l = &mut slot.lifecycle;
            if l.closing && !l.close_sent && !l.is_destroyed() && slot.pending.is_empty() {
                l.close_sent = true;
                let handle = slot.handle;
                log::debug!("[conn] {handle} queue drained, closing");
                engine.close(handle, self);
            }
        }
        Ok(())
    }

    /// Graceful close.  No-op on a connection already closing or destroyed.
    pub(crate) fn close(&mut self, engine: &mut dyn Engine, id: ConnId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        if slot.lifecycle.closing || slot.lifecycle.is_destroyed() {
            return;
        }
        slot.lifecycle.closing = true;
        let handle = slot.handle;
        if slot.pending.is_empty() {
            slot.lifecycle.close_sent = true;
            log::debug!("[conn] {handle} closing");
            engine.close(handle, self);
        } else {
            log::debug!(
                "[conn] {handle} close deferred until {} queued bytes drain",
                slot.pending_bytes()
            );
        }
        self.settle(engine);
    }

    /// Immediate teardown.  Queued bytes are dropped and `connection_lost`
    /// carries no error.
    pub(crate) fn abort(&mut self, engine: &mut dyn Engine, id: ConnId) {
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        let handle = slot.handle;
        if slot.abort(None) {
            log::debug!("[conn] {handle} aborted");
            engine.close(handle, self);
        }
        self.settle(engine);
    }

    pub(crate) fn pause_reading(&mut self, id: ConnId) -> Result<()> {
        let slot = self.slots.get(&id).ok_or(Error::Closed)?;
        if slot.lifecycle.closing || slot.lifecycle.is_destroyed() {
            return Err(Error::Closing);
        }
        if self.reading_paused {
            return Err(Error::AlreadyPaused);
        }
        self.reading_paused = true;
        log::debug!("[endpoint] {} reading paused", self.local);
        Ok(())
    }

    pub(crate) fn resume_reading(&mut self, id: ConnId) -> Result<()> {
        if !self.slots.contains_key(&id) {
            return Err(Error::Closed);
        }
        if !self.reading_paused {
            return Err(Error::NotPaused);
        }
        self.reading_paused = false;
        log::debug!("[endpoint] {} reading resumed", self.local);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ConnectionRef
// ---------------------------------------------------------------------------

/// The connection as seen from inside a [`Protocol`] callback.
pub struct ConnectionRef<'a> {
    engine: &'a mut dyn Engine,
    core: &'a mut Core,
    id: ConnId,
    handle: SocketHandle,
    peer: SocketAddr,
}

impl<'a> ConnectionRef<'a> {
    pub(crate) fn new(
        engine: &'a mut dyn Engine,
        core: &'a mut Core,
        id: ConnId,
        handle: SocketHandle,
        peer: SocketAddr,
    ) -> Self {
        Self {
            engine,
            core,
            id,
            handle,
            peer,
        }
    }

    /// Queue `data` for delivery.  Fails with [`Error::Closing`] once a close
    /// was requested.
    pub fn write(&mut self, data: &[u8]) -> Result<WriteStatus> {
        self.core.write(&mut *self.engine, self.id, data)
    }

    /// Request a graceful close; queued data is still delivered.
    pub fn close(&mut self) {
        self.core.close(&mut *self.engine, self.id);
    }

    /// Tear the connection down now, dropping queued data.
    pub fn abort(&mut self) {
        self.core.abort(&mut *self.engine, self.id);
    }

    pub fn is_closing(&self) -> bool {
        self.core
            .slots
            .get(&self.id)
            .map_or(true, |slot| slot.lifecycle.closing || slot.lifecycle.is_destroyed())
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_name(&self) -> PeerName {
        addr::from_native(self.peer)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.core.local
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    /// A handle that outlives the callback.
    pub fn connection(&self) -> Option<Connection> {
        self.core.connection_handle(self.id)
    }

    pub(crate) fn take_error(&mut self) -> Option<Error> {
        self.core
            .slots
            .get_mut(&self.id)
            .and_then(|slot| slot.lifecycle.take_error())
    }
}

// ---------------------------------------------------------------------------
// Connection handle
// ---------------------------------------------------------------------------

/// Application handle to a connection; cheap to clone.
///
/// Every operation is a message to the endpoint task that owns the
/// connection.  Once that task is gone, writes fail with [`Error::Closed`].
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnId,
    handle: SocketHandle,
    peer: SocketAddr,
    local: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    closed: ClosedRx,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        handle: SocketHandle,
        peer: SocketAddr,
        local: SocketAddr,
        commands: mpsc::UnboundedSender<Command>,
        closed: ClosedRx,
    ) -> Self {
        Self {
            id,
            handle,
            peer,
            local,
            commands,
            closed,
        }
    }

    pub async fn write(&self, data: &[u8]) -> Result<WriteStatus> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Write {
                id: self.id,
                data: data.to_vec(),
                reply,
            })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    /// Request a graceful close.  Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Close { id: self.id });
    }

    /// Close immediately.  Bytes still queued are discarded and
    /// `connection_lost` receives no error.  Idempotent.
    pub fn abort(&self) {
        let _ = self.commands.send(Command::Abort { id: self.id });
    }

    /// Resolves once `connection_lost` has been delivered.
    ///
    /// Returns the endpoint's first protocol violation, or the socket error
    /// that killed the connection, if any.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut closed = self.closed.clone();
        let outcome = closed
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::EndpointGone)?
            .clone();
        outcome.unwrap_or(Ok(()))
    }

    /// `connection_lost` has been delivered.
    pub fn is_closed(&self) -> bool {
        self.closed.borrow().is_some()
    }

    /// Stop reading the endpoint's UDP socket.  Affects every connection
    /// sharing that socket.
    pub async fn pause_reading(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::PauseReading { id: self.id, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub async fn resume_reading(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::ResumeReading { id: self.id, reply })
            .map_err(|_| Error::Closed)?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn peer_name(&self) -> PeerName {
        addr::from_native(self.peer)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn handle(&self) -> SocketHandle {
        self.handle
    }
}

// ---------------------------------------------------------------------------
// Outbound connect
// ---------------------------------------------------------------------------

/// Connect to `peer` over a fresh endpoint running an [`ArqEngine`].
pub async fn connect<P: Protocol>(
    peer: SocketAddr,
    config: EndpointConfig,
    protocol: P,
) -> Result<Connection> {
    let engine = ArqEngine::with_config(config.engine.clone(), config.arq.clone());
    connect_with_engine(peer, config, Box::new(engine), protocol).await
}

/// Connect using a caller-initialised engine.
///
/// Argument errors from the engine's `connect` are returned here; every
/// later failure reaches `protocol.connection_lost`.
pub async fn connect_with_engine<P: Protocol>(
    peer: SocketAddr,
    config: EndpointConfig,
    mut engine: Box<dyn Engine>,
    protocol: P,
) -> Result<Connection> {
    let socket = DatagramSocket::bind(config.bind_addr)
        .await
        .map_err(Error::bind)?;
    let (commands, inbox) = mpsc::unbounded_channel();
    let mut core = Core::new(socket.local_addr(), Role::Client, &config, commands);

    let handle = engine.create_socket();
    let id = core.register(handle, peer, Lifecycle::connecting(), Some(Box::new(protocol)));
    if let Err(e) = engine.connect(handle, peer, &mut core) {
        log::warn!("[conn] connect to {peer} rejected: {e}");
        engine.destroy();
        return Err(e.into());
    }
    let conn = core.connection_handle(id).ok_or(Error::Closed)?;
    log::debug!("[conn] {handle} connecting {} -> {peer}", core.local);

    Endpoint::new(socket, engine, core, inbox, &config).spawn();
    Ok(conn)
}

/// Connect to `host:port`; `host` must be an IP literal.
pub async fn connect_host<P: Protocol>(
    host: &str,
    port: u16,
    config: EndpointConfig,
    protocol: P,
) -> Result<Connection> {
    let peer = addr::to_native(host, port)?;
    connect(peer, config, protocol).await
}

/// Stream-style connect: events arrive on the returned [`EventStream`].
pub async fn open_connection(
    peer: SocketAddr,
    config: EndpointConfig,
) -> Result<(Connection, EventStream)> {
    let (protocol, events) = ChannelProtocol::new();
    let conn = connect(peer, config, protocol).await?;
    Ok((conn, events))
}
