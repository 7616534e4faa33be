//! Accepting endpoint.
//!
//! A [`Listener`] owns one UDP socket in accepting mode.  Every inbound
//! attempt is offered to its [`AcceptPolicy`] before a connection exists;
//! admitted attempts get a handler from the protocol factory.
//!
//! Shutdown is two-phase:
//!
//! ```text
//!  open ──close()──▶ closed, draining ──last connection lost──▶ finished
//!        (gate rejects; every active connection is closed)
//! ```
//!
//! [`Listener::wait_closed`] resolves only at "finished".

use std::collections::HashSet;
use std::net::SocketAddr;

use tokio::sync::{mpsc, watch};

use crate::config::EndpointConfig;
use crate::connection::Connection;
use crate::endpoint::{ClosedRx, ClosedTx, Command, ConnId, Core, Endpoint, Role};
use crate::engine::arq::ArqEngine;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::protocol::{ChannelProtocol, EventStream, Protocol};
use crate::socket::DatagramSocket;

/// Admission decision for inbound connection attempts.
///
/// Called on the endpoint task for every attempt, so it must be cheap.
/// `active` is the number of connections currently accepted and not closed
/// by the listener.
pub trait AcceptPolicy: Send + Sync {
    fn admit(&self, peer: SocketAddr, active: usize) -> bool;
}

/// Admit everyone.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl AcceptPolicy for AcceptAll {
    fn admit(&self, _peer: SocketAddr, _active: usize) -> bool {
        true
    }
}

/// Admit one connection at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePeer;

impl AcceptPolicy for SinglePeer {
    fn admit(&self, _peer: SocketAddr, active: usize) -> bool {
        active == 0
    }
}

impl<F> AcceptPolicy for F
where
    F: Fn(SocketAddr, usize) -> bool + Send + Sync,
{
    fn admit(&self, peer: SocketAddr, active: usize) -> bool {
        self(peer, active)
    }
}

/// Builds the handler of each accepted connection.
///
/// Runs on the endpoint task when the connection's `connection_made` is
/// about to be delivered, never from inside an engine call.
pub type ProtocolFactory = Box<dyn FnMut(&Connection) -> Box<dyn Protocol> + Send>;

// ---------------------------------------------------------------------------
// Listener state (endpoint task side)
// ---------------------------------------------------------------------------

pub(crate) struct ListenerState {
    policy: Box<dyn AcceptPolicy>,
    factory: ProtocolFactory,
    active: HashSet<ConnId>,
    draining: HashSet<ConnId>,
    closed: bool,
    closed_tx: ClosedTx,
}

impl ListenerState {
    pub(crate) fn new(policy: Box<dyn AcceptPolicy>, factory: ProtocolFactory, closed_tx: ClosedTx) -> Self {
        Self {
            policy,
            factory,
            active: HashSet::new(),
            draining: HashSet::new(),
            closed: false,
            closed_tx,
        }
    }

    pub(crate) fn admit(&self, peer: SocketAddr) -> bool {
        !self.closed && self.policy.admit(peer, self.active.len())
    }

    pub(crate) fn track(&mut self, id: ConnId) {
        self.active.insert(id);
    }

    pub(crate) fn build_protocol(&mut self, conn: &Connection) -> Box<dyn Protocol> {
        (self.factory)(conn)
    }

    /// Phase one of shutdown.  Returns the connections to close, or `None`
    /// if the listener was already closed.
    pub(crate) fn begin_close(&mut self) -> Option<Vec<ConnId>> {
        if self.closed {
            return None;
        }
        self.closed = true;
        let ids: Vec<ConnId> = self.active.drain().collect();
        self.draining.extend(ids.iter().copied());
        Some(ids)
    }

    pub(crate) fn mark_closed(&mut self) {
        self.closed = true;
    }

    pub(crate) fn forget(&mut self, id: ConnId) {
        self.active.remove(&id);
        self.draining.remove(&id);
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.closed && self.active.is_empty() && self.draining.is_empty()
    }

    pub(crate) fn notify_closed(&self, outcome: Result<()>) {
        self.closed_tx.send_replace(Some(outcome));
    }
}

// ---------------------------------------------------------------------------
// Listener handle
// ---------------------------------------------------------------------------

/// Handle to a listening endpoint.  Dropping it closes the listener.
#[derive(Debug)]
pub struct Listener {
    local: SocketAddr,
    commands: mpsc::UnboundedSender<Command>,
    closed: ClosedRx,
}

impl Listener {
    /// Listen on `config.bind_addr` with an [`ArqEngine`].
    pub async fn bind<P, F>(config: EndpointConfig, policy: P, factory: F) -> Result<Self>
    where
        P: AcceptPolicy + 'static,
        F: FnMut(&Connection) -> Box<dyn Protocol> + Send + 'static,
    {
        let engine = ArqEngine::with_config(config.engine.clone(), config.arq.clone());
        Self::bind_with_engine(config, Box::new(engine), policy, factory).await
    }

    /// Listen using a caller-initialised engine.
    pub async fn bind_with_engine<P, F>(
        config: EndpointConfig,
        engine: Box<dyn Engine>,
        policy: P,
        factory: F,
    ) -> Result<Self>
    where
        P: AcceptPolicy + 'static,
        F: FnMut(&Connection) -> Box<dyn Protocol> + Send + 'static,
    {
        let socket = DatagramSocket::bind(config.bind_addr)
            .await
            .map_err(Error::bind)?;
        let local = socket.local_addr();
        let (commands, inbox) = mpsc::unbounded_channel();
        let (closed_tx, closed) = watch::channel(None);

        let state = ListenerState::new(Box::new(policy), Box::new(factory), closed_tx);
        let core = Core::new(local, Role::Listener(state), &config, commands.clone());
        Endpoint::new(socket, engine, core, inbox, &config).spawn();
        log::info!("[listener] listening on {local}");

        Ok(Self {
            local,
            commands,
            closed,
        })
    }

    /// Stream-style listener: each accepted connection arrives on the
    /// returned channel together with its [`EventStream`].
    pub async fn bind_streams<P>(
        config: EndpointConfig,
        policy: P,
    ) -> Result<(Self, mpsc::UnboundedReceiver<(Connection, EventStream)>)>
    where
        P: AcceptPolicy + 'static,
    {
        let (accepted_tx, accepted) = mpsc::unbounded_channel();
        let listener = Self::bind(config, policy, move |conn: &Connection| -> Box<dyn Protocol> {
            let (protocol, events) = ChannelProtocol::new();
            let _ = accepted_tx.send((conn.clone(), events));
            Box::new(protocol)
        })
        .await?;
        Ok((listener, accepted))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    /// Stop accepting and close every active connection.  Idempotent.
    pub fn close(&self) {
        let _ = self.commands.send(Command::CloseListener);
    }

    /// Resolves once the listener is closed and every connection it
    /// accepted has been lost.
    pub async fn wait_closed(&self) -> Result<()> {
        let mut closed = self.closed.clone();
        let outcome = closed
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::EndpointGone)?
            .clone();
        outcome.unwrap_or(Ok(()))
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.close();
    }
}
