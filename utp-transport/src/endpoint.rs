//! The endpoint task: one UDP socket, one engine, many connections.
//!
//! ```text
//!   Connection / Listener handles
//!            │  Command (mpsc)
//!            ▼
//!  ┌──────────────────── endpoint task ─────────────────────┐
//!  │  loop {                                                │
//!  │    dispatch deferred events ──▶ Protocol handlers      │
//!  │    flush outbound datagrams                            │
//!  │    select! {                                           │
//!  │      writable  (only while outbound is non-empty)      │
//!  │      readable  ─▶ process_datagram* ─▶ deferred acks   │
//!  │      command   ─▶ write / close / pause / shutdown     │
//!  │      tick      ─▶ check_timeouts                       │
//!  │    }                                                   │
//!  │  }                                                     │
//!  │                                                        │
//!  │  Box<dyn Engine> ──callbacks──▶ Core (EngineCallbacks) │
//!  └────────────────────────────────────────────────────────┘
//! ```
//!
//! Engine callbacks may fire synchronously inside any engine call.  The
//! [`Core`] only records what they mean: application events go to the
//! deferred FIFO, engine calls they require go to the follow-up queue that is
//! run once the outer engine call has returned.  No handler code ever runs
//! inside an engine call.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};

use crate::config::{EndpointConfig, WriteStallPolicy};
use crate::connection::{Connection, ConnectionRef, ConnectionSlot, WriteStatus};
use crate::engine::{Engine, EngineCallbacks, EngineState, SocketHandle};
use crate::error::{Error, Result, TransportError};
use crate::listener::ListenerState;
use crate::protocol::Protocol;
use crate::socket::{DatagramSocket, OutboundQueue};
use crate::state::Lifecycle;

/// Upper bound on waiting for the socket to take a teardown's last datagrams.
const OUTBOUND_LINGER: Duration = Duration::from_millis(500);

/// Context-local serial id of a connection slot.  Never reused, unlike
/// engine handles.
pub(crate) type ConnId = u64;

/// Terminal outcome published to `wait_closed` waiters.
pub(crate) type ClosedTx = watch::Sender<Option<Result<()>>>;
pub(crate) type ClosedRx = watch::Receiver<Option<Result<()>>>;

/// Requests from application handles to the endpoint task.
#[derive(Debug)]
pub(crate) enum Command {
    Write {
        id: ConnId,
        data: Vec<u8>,
        reply: oneshot::Sender<Result<WriteStatus>>,
    },
    Close {
        id: ConnId,
    },
    Abort {
        id: ConnId,
    },
    PauseReading {
        id: ConnId,
        reply: oneshot::Sender<Result<()>>,
    },
    ResumeReading {
        id: ConnId,
        reply: oneshot::Sender<Result<()>>,
    },
    CloseListener,
}

/// Application events awaiting delivery at the top of the next loop turn.
#[derive(Debug)]
pub(crate) enum Deferred {
    Established(ConnId),
    Data(ConnId, Vec<u8>),
    Eof(ConnId),
    Lost(ConnId),
}

impl Deferred {
    fn id(&self) -> ConnId {
        match self {
            Self::Established(id) | Self::Data(id, _) | Self::Eof(id) | Self::Lost(id) => *id,
        }
    }
}

/// Engine calls requested from inside a callback.
#[derive(Debug)]
pub(crate) enum FollowUp {
    ReadDrained(SocketHandle),
    Close(SocketHandle),
    Flush(ConnId),
}

pub(crate) enum Role {
    /// Owns a single outbound connection; never accepts.
    Client,
    Listener(ListenerState),
}

// ---------------------------------------------------------------------------
// Core: connection arena + callback sink
// ---------------------------------------------------------------------------

pub(crate) struct Core {
    pub(crate) local: SocketAddr,
    pub(crate) role: Role,
    pub(crate) slots: HashMap<ConnId, ConnectionSlot>,
    /// Live engine handles only; entries go away on DESTROYING.
    pub(crate) handles: HashMap<SocketHandle, ConnId>,
    next_id: ConnId,
    pub(crate) outbound: OutboundQueue,
    pub(crate) deferred: VecDeque<Deferred>,
    pub(crate) follow_ups: VecDeque<FollowUp>,
    /// First protocol violation observed on this endpoint.
    pub(crate) violation: Option<Error>,
    /// Fatal socket error; set once, right before teardown.
    failure: Option<Error>,
    pub(crate) write_stall: WriteStallPolicy,
    pub(crate) reading_paused: bool,
    commands: mpsc::UnboundedSender<Command>,
}

impl Core {
    pub(crate) fn new(
        local: SocketAddr,
        role: Role,
        config: &EndpointConfig,
        commands: mpsc::UnboundedSender<Command>,
    ) -> Self {
        Self {
            local,
            role,
            slots: HashMap::new(),
            handles: HashMap::new(),
            next_id: 1,
            outbound: OutboundQueue::new(),
            deferred: VecDeque::new(),
            follow_ups: VecDeque::new(),
            violation: None,
            failure: None,
            write_stall: config.write_stall,
            reading_paused: false,
            commands,
        }
    }

    pub(crate) fn register(
        &mut self,
        handle: SocketHandle,
        peer: SocketAddr,
        lifecycle: Lifecycle,
        protocol: Option<Box<dyn Protocol>>,
    ) -> ConnId {
        let id = self.next_id;
        self.next_id += 1;
        self.slots
            .insert(id, ConnectionSlot::new(handle, peer, lifecycle, protocol));
        self.handles.insert(handle, id);
        id
    }

    /// A detached application handle for slot `id`.
    pub(crate) fn connection_handle(&self, id: ConnId) -> Option<Connection> {
        let slot = self.slots.get(&id)?;
        Some(Connection::new(
            id,
            slot.handle,
            slot.peer,
            self.local,
            self.commands.clone(),
            slot.closed.subscribe(),
        ))
    }

    fn report_violation(&mut self, reason: String) {
        log::error!("[endpoint] {} protocol violation: {reason}", self.local);
        if self.violation.is_none() {
            self.violation = Some(Error::ProtocolViolation(reason));
        }
    }

    fn lookup(&mut self, handle: SocketHandle, what: impl std::fmt::Display) -> Option<ConnId> {
        let id = self.handles.get(&handle).copied();
        if id.is_none() {
            self.report_violation(format!("{what} for unknown handle {handle}"));
        }
        id
    }

    /// Run the engine calls queued by callbacks, including any they queue in
    /// turn.
    pub(crate) fn settle(&mut self, engine: &mut dyn Engine) {
        while let Some(next) = self.follow_ups.pop_front() {
            match next {
                FollowUp::ReadDrained(handle) => {
                    if self.handles.contains_key(&handle) {
                        engine.read_drained(handle);
                    }
                }
                FollowUp::Close(handle) => {
                    if self.handles.contains_key(&handle) {
                        engine.close(handle, self);
                    }
                }
                FollowUp::Flush(id) => {
                    if let Err(e) = self.flush(engine, id) {
                        log::debug!("[conn] flush of connection {id} failed: {e}");
                    }
                }
            }
        }
    }

    /// Drop a slot once its `lost` event has been delivered.
    fn release(&mut self, id: ConnId) {
        let Some(slot) = self.slots.remove(&id) else {
            return;
        };
        self.handles.retain(|_, v| *v != id);
        slot.closed.send_replace(Some(self.outcome()));
        if let Role::Listener(listener) = &mut self.role {
            listener.forget(id);
        }
        log::debug!("[conn] {} ({}) released", slot.handle, slot.peer);
    }

    pub(crate) fn close_listener(&mut self, engine: &mut dyn Engine) {
        let Role::Listener(listener) = &mut self.role else {
            return;
        };
        let Some(ids) = listener.begin_close() else {
            return;
        };
        log::info!(
            "[listener] {} closing, draining {} connection(s)",
            self.local,
            ids.len()
        );
        for id in ids {
            self.close(engine, id);
        }
    }

    /// Handler for a connection accepted by the listener.
    fn build_protocol(&mut self, id: ConnId) -> Option<Box<dyn Protocol>> {
        let conn = self.connection_handle(id)?;
        match &mut self.role {
            Role::Listener(listener) => Some(listener.build_protocol(&conn)),
            Role::Client => None,
        }
    }

    /// The owner's teardown condition holds.
    fn finished(&self) -> bool {
        match &self.role {
            Role::Client => self.slots.is_empty(),
            Role::Listener(listener) => listener.is_finished() && self.slots.is_empty(),
        }
    }

    /// What `wait_closed` reports: the socket failure, else the first
    /// violation.  Transport errors only reach `connection_lost`.
    fn outcome(&self) -> Result<()> {
        match self.failure.as_ref().or(self.violation.as_ref()) {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl EngineCallbacks for Core {
    fn on_sendto(&mut self, _handle: Option<SocketHandle>, datagram: &[u8], to: SocketAddr) {
        self.outbound.push_back((datagram.to_vec(), to));
    }

    fn on_state_change(&mut self, handle: SocketHandle, state: EngineState) {
        let Some(id) = self.lookup(handle, state) else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        log::debug!("[conn] {handle} {} <- {state}", slot.lifecycle.phase());

        let result = match state {
            EngineState::Connect | EngineState::Writable => match slot.lifecycle.on_writable() {
                Ok(first) => {
                    if first {
                        self.deferred.push_back(Deferred::Established(id));
                    }
                    self.follow_ups.push_back(FollowUp::Flush(id));
                    Ok(())
                }
                Err(reason) => Err(reason),
            },
            EngineState::Eof => match slot.lifecycle.on_eof() {
                Ok(first) => {
                    if first {
                        self.deferred.push_back(Deferred::Eof(id));
                    }
                    Ok(())
                }
                Err(reason) => Err(reason),
            },
            EngineState::Destroying => match slot.lifecycle.on_destroying() {
                Ok(()) => {
                    self.handles.remove(&handle);
                    self.deferred.push_back(Deferred::Lost(id));
                    Ok(())
                }
                Err(reason) => Err(reason),
            },
        };
        if let Err(reason) = result {
            self.report_violation(format!("{reason} on {handle}"));
        }
    }

    fn on_error(&mut self, handle: SocketHandle, error: TransportError) {
        let Some(id) = self.lookup(handle, "error") else {
            return;
        };
        let Some(slot) = self.slots.get_mut(&id) else {
            return;
        };
        log::debug!("[conn] {handle} error: {error}");
        if slot.abort(Some(error.into())) {
            self.follow_ups.push_back(FollowUp::Close(handle));
        }
    }

    fn on_read(&mut self, handle: SocketHandle, data: &[u8]) {
        let Some(id) = self.lookup(handle, "read") else {
            return;
        };
        self.deferred.push_back(Deferred::Data(id, data.to_vec()));
        self.follow_ups.push_back(FollowUp::ReadDrained(handle));
    }

    fn on_firewall(&mut self, from: SocketAddr) -> bool {
        match &self.role {
            Role::Client => {
                log::info!(
                    "[endpoint] {} rejecting connection from {from}: not listening",
                    self.local
                );
                false
            }
            Role::Listener(listener) => {
                let admit = listener.admit(from);
                if !admit {
                    log::warn!("[listener] {} rejected connection from {from}", self.local);
                }
                admit
            }
        }
    }

    fn on_accept(&mut self, handle: SocketHandle, from: SocketAddr) {
        if !matches!(self.role, Role::Listener(_)) {
            self.report_violation(format!(
                "accept of {handle} from {from} on a non-listening endpoint"
            ));
            return;
        }
        if self.handles.contains_key(&handle) {
            self.report_violation(format!("accept reused live handle {handle}"));
            return;
        }

        let id = self.register(handle, from, Lifecycle::accepted(), None);
        if let Role::Listener(listener) = &mut self.role {
            listener.track(id);
        }
        log::info!("[listener] {} accepted {from} as {handle}", self.local);
        self.deferred.push_back(Deferred::Established(id));
    }

    fn on_log(&mut self, handle: Option<SocketHandle>, message: &str) {
        match handle {
            Some(handle) => log::debug!("[engine] {handle}: {message}"),
            None => log::debug!("[engine] {message}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Endpoint task
// ---------------------------------------------------------------------------

pub(crate) struct Endpoint {
    socket: DatagramSocket,
    engine: Box<dyn Engine>,
    core: Core,
    commands: mpsc::UnboundedReceiver<Command>,
    tick_interval: Duration,
    max_datagram: usize,
}

impl Endpoint {
    pub(crate) fn new(
        socket: DatagramSocket,
        engine: Box<dyn Engine>,
        core: Core,
        commands: mpsc::UnboundedReceiver<Command>,
        config: &EndpointConfig,
    ) -> Self {
        Self {
            socket,
            engine,
            core,
            commands,
            tick_interval: config.tick_interval,
            max_datagram: config.max_datagram.max(1),
        }
    }

    pub(crate) fn spawn(self) {
        tokio::spawn(self.run());
    }

    async fn run(mut self) {
        log::debug!("[endpoint] {} running", self.core.local);
        let mut ticker = interval(self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut buf = vec![0u8; self.max_datagram];

        let fatal = loop {
            self.dispatch_deferred();
            if let Err(e) = self.socket.flush(&mut self.core.outbound) {
                break Some(e);
            }
            if self.core.finished() {
                break None;
            }
            if !self.core.deferred.is_empty() {
                // Handlers queued more events; deliver them on the next turn.
                tokio::task::yield_now().await;
                continue;
            }

            let want_write = !self.core.outbound.is_empty();
            let want_read = !self.core.reading_paused;
            let result = tokio::select! {
                ready = self.socket.writable(), if want_write => match ready {
                    Ok(()) => self.socket.flush(&mut self.core.outbound),
                    Err(e) => Err(e),
                },
                ready = self.socket.readable(), if want_read => match ready {
                    Ok(()) => self.drain_inbound(&mut buf),
                    Err(e) => Err(e),
                },
                Some(command) = self.commands.recv() => {
                    self.handle_command(command);
                    Ok(())
                }
                _ = ticker.tick() => {
                    self.engine.check_timeouts(&mut self.core);
                    self.core.settle(self.engine.as_mut());
                    Ok(())
                }
            };
            if let Err(e) = result {
                break Some(e);
            }
        };

        match fatal {
            Some(e) => self.fail(e),
            None => {
                self.drain_outbound().await;
                self.shutdown();
            }
        }
    }

    /// Give datagrams still queued behind a would-block a bounded chance to
    /// leave before the socket is dropped.
    async fn drain_outbound(&mut self) {
        let Self { socket, core, .. } = self;
        let drained = timeout(OUTBOUND_LINGER, async {
            while !core.outbound.is_empty() {
                socket.writable().await?;
                socket.flush(&mut core.outbound)?;
            }
            Ok::<_, io::Error>(())
        })
        .await;
        match drained {
            Ok(Ok(())) => {}
            Ok(Err(e)) => log::debug!("[endpoint] {} final flush failed: {e}", core.local),
            Err(_) => log::warn!(
                "[endpoint] {} dropping {} unsent datagram(s)",
                core.local,
                core.outbound.len()
            ),
        }
    }

    /// Feed every pending datagram to the engine, then flush deferred ACKs.
    fn drain_inbound(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let Self {
            socket,
            engine,
            core,
            ..
        } = self;
        let count = socket.drain(buf, |datagram, from| {
            if !engine.process_datagram(datagram, from, &mut *core) {
                log::debug!(
                    "[endpoint] {} byte datagram from {from} not recognised",
                    datagram.len()
                );
            }
            core.settle(engine.as_mut());
            !core.reading_paused
        })?;
        if count > 0 {
            engine.issue_deferred_acks(&mut *core);
            core.settle(engine.as_mut());
        }
        Ok(())
    }

    fn handle_command(&mut self, command: Command) {
        let engine = self.engine.as_mut();
        let core = &mut self.core;
        match command {
            Command::Write { id, data, reply } => {
                let _ = reply.send(core.write(engine, id, &data));
            }
            Command::Close { id } => core.close(engine, id),
            Command::Abort { id } => core.abort(engine, id),
            Command::PauseReading { id, reply } => {
                let _ = reply.send(core.pause_reading(id));
            }
            Command::ResumeReading { id, reply } => {
                let _ = reply.send(core.resume_reading(id));
            }
            Command::CloseListener => core.close_listener(engine),
        }
    }

    fn dispatch_deferred(&mut self) {
        let batch = std::mem::take(&mut self.core.deferred);
        for event in batch {
            self.dispatch(event);
        }
    }

    /// Deliver one event to its handler.  The handler is taken out of the
    /// slot for the duration of the call.
    fn dispatch(&mut self, event: Deferred) {
        let id = event.id();
        let Some(slot) = self.core.slots.get_mut(&id) else {
            log::debug!("[endpoint] dropping {event:?}: connection already released");
            return;
        };
        let mut protocol = slot.protocol.take();
        let (handle, peer) = (slot.handle, slot.peer);
        if protocol.is_none() && matches!(event, Deferred::Established(_)) {
            protocol = self.core.build_protocol(id);
        }
        let mut conn = ConnectionRef::new(self.engine.as_mut(), &mut self.core, id, handle, peer);

        match event {
            Deferred::Established(_) => {
                if let Some(p) = protocol.as_mut() {
                    p.connection_made(&mut conn);
                }
            }
            Deferred::Data(_, data) => {
                if let Some(p) = protocol.as_mut() {
                    p.data_received(&mut conn, &data);
                }
            }
            Deferred::Eof(_) => {
                let keep_open = protocol.as_mut().map_or(false, |p| p.eof_received(&mut conn));
                if !keep_open {
                    conn.close();
                }
            }
            Deferred::Lost(_) => {
                let error = conn.take_error();
                if let Some(p) = protocol.as_mut() {
                    p.connection_lost(&mut conn, error);
                }
                drop(protocol);
                self.core.release(id);
                self.core.settle(self.engine.as_mut());
                return;
            }
        }

        if let Some(slot) = self.core.slots.get_mut(&id) {
            slot.protocol = protocol;
        }
        self.core.settle(self.engine.as_mut());
    }

    /// The socket is unusable: every live connection is lost with the socket
    /// error and the engine is torn down.
    fn fail(&mut self, e: io::Error) {
        log::error!("[endpoint] socket {} failed: {e}", self.core.local);
        let error = Error::socket(e);
        self.core.failure = Some(error.clone());

        self.core.outbound.clear();
        self.core.handles.clear();
        if let Role::Listener(listener) = &mut self.core.role {
            listener.mark_closed();
        }
        let ids: Vec<ConnId> = self.core.slots.keys().copied().collect();
        for id in ids {
            if let Some(slot) = self.core.slots.get_mut(&id) {
                if slot.lifecycle.on_destroying().is_ok() {
                    slot.lifecycle.record_error(error.clone());
                    slot.pending.clear();
                    self.core.deferred.push_back(Deferred::Lost(id));
                }
            }
        }
        while !self.core.deferred.is_empty() {
            self.dispatch_deferred();
        }

        self.engine.destroy();
        if let Role::Listener(listener) = &self.core.role {
            listener.notify_closed(self.core.outcome());
        }
    }

    fn shutdown(&mut self) {
        self.engine.destroy();
        let outcome = self.core.outcome();
        if let Role::Listener(listener) = &self.core.role {
            listener.notify_closed(outcome);
        }
        log::info!("[endpoint] {} shut down", self.core.local);
    }
}
