//! `ArqEngine`: the in-crate reference engine.
//!
//! A small Go-Back-N ARQ stream protocol that satisfies the [`Engine`]
//! contract.  Many logical connections share one UDP socket; each is keyed by
//! `(peer address, connection id)`.
//!
//! ```text
//!  connect ──SYN──▶            ◀──SYN──  (on_firewall → on_accept)
//!          ◀──SYN|ACK──        ──SYN|ACK──▶
//!  CONNECT ──ACK──▶
//!          ◀═══ DATA / cumulative ACK ═══▶
//!  close   ──FIN──▶            EOF
//!          ◀──FIN──            close
//!  DESTROYING (own FIN acked and peer FIN seen, or linger elapsed)
//! ```
//!
//! Sans-IO: every outbound datagram leaves through
//! [`EngineCallbacks::on_sendto`], every notification through the other
//! callbacks.  Time only advances through [`Engine::check_timeouts`].

pub mod packet;
pub mod receiver;
pub mod rto;
pub mod sender;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use rand::Rng;

use self::packet::{flags, Packet, HEADER_LEN};
use self::receiver::GbnReceiver;
use self::rto::RetransmitTimer;
use self::sender::GbnSender;
use super::{Engine, EngineCallbacks, EngineOptions, EngineState, SocketHandle};
use crate::error::{EngineError, TransportError};

/// Tuning knobs for [`ArqEngine`].
#[derive(Debug, Clone)]
pub struct ArqConfig {
    /// RTO before any RTT sample is available.
    pub initial_rto: Duration,
    /// Ceiling for exponential back-off.
    pub max_rto: Duration,
    /// Consecutive timeouts tolerated before reporting `TimedOut`.
    pub max_retries: u32,
    /// Go-Back-N window, in segments.
    pub window: usize,
    /// Largest payload per segment.
    pub mss: usize,
    /// How long a closed socket waits for the peer's FIN once its own FIN
    /// has been acknowledged.
    pub linger: Duration,
}

impl Default for ArqConfig {
    fn default() -> Self {
        Self {
            initial_rto: Duration::from_millis(1000),
            max_rto: Duration::from_secs(60),
            max_retries: 6,
            window: 32,
            mss: 1200,
            linger: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    SynSent,
    Established,
    /// Reset or timed out; waits for the adapter's `close`.
    Failed,
}

/// A retransmittable control segment (SYN, SYN|ACK or FIN).
#[derive(Debug)]
struct Control {
    packet: Packet,
    sent_at: Instant,
    tries: u32,
}

#[derive(Debug)]
struct Conn {
    handle: SocketHandle,
    peer: SocketAddr,
    conn_id: u16,
    phase: Phase,
    sender: GbnSender,
    receiver: GbnReceiver,
    rto: RetransmitTimer,
    retries: u32,
    /// Bytes accepted from `write` but not yet segmented.
    send_queue: VecDeque<u8>,
    /// A `write` came up short; report WRITABLE once room frees up.
    blocked: bool,
    syn: Option<Control>,
    fin: Option<Control>,
    fin_acked_at: Option<Instant>,
    close_requested: bool,
    peer_fin: bool,
    ack_pending: bool,
}

fn transmit(cb: &mut dyn EngineCallbacks, handle: Option<SocketHandle>, packet: &Packet, to: SocketAddr) {
    cb.on_sendto(handle, &packet.encode(), to);
}

fn emit(enabled: bool, cb: &mut dyn EngineCallbacks, handle: Option<SocketHandle>, message: impl FnOnce() -> String) {
    if enabled {
        cb.on_log(handle, &message());
    }
}

fn log_segment_size(options: &EngineOptions, config: &ArqConfig, cb: &mut dyn EngineCallbacks, handle: SocketHandle) {
    emit(options.log_mtu, cb, Some(handle), || {
        format!(
            "segment size {} bytes ({} on the wire)",
            config.mss,
            config.mss + HEADER_LEN
        )
    });
}

impl Conn {
    fn new(
        handle: SocketHandle,
        peer: SocketAddr,
        conn_id: u16,
        phase: Phase,
        isn: u32,
        rcv_nxt: u32,
        config: &ArqConfig,
        options: &EngineOptions,
    ) -> Self {
        Self {
            handle,
            peer,
            conn_id,
            phase,
            sender: GbnSender::new(isn.wrapping_add(1), config.window),
            receiver: GbnReceiver::new(rcv_nxt, options.recv_buffer),
            rto: RetransmitTimer::new(config.initial_rto, config.max_rto),
            retries: 0,
            send_queue: VecDeque::new(),
            blocked: false,
            syn: None,
            fin: None,
            fin_acked_at: None,
            close_requested: false,
            peer_fin: false,
            ack_pending: false,
        }
    }

    fn control(&self, flags: u8) -> Packet {
        Packet::control(
            self.conn_id,
            self.sender.next_seq,
            self.receiver.ack_number(),
            flags,
            self.receiver.window_size(),
        )
    }

    fn send_ack(&mut self, cb: &mut dyn EngineCallbacks) {
        let ack = self.control(flags::ACK);
        transmit(cb, Some(self.handle), &ack, self.peer);
        self.ack_pending = false;
    }

    /// Bytes the socket is still responsible for.
    fn buffered(&self) -> usize {
        self.send_queue.len() + self.sender.bytes_in_flight()
    }

    /// Segment queued bytes into the window; emit FIN once a requested close
    /// has nothing left to deliver.
    fn pump(&mut self, config: &ArqConfig, cb: &mut dyn EngineCallbacks) {
        if self.phase != Phase::Established {
            return;
        }
        while self.sender.can_send() && !self.send_queue.is_empty() {
            let n = config.mss.min(self.send_queue.len());
            let payload: Vec<u8> = self.send_queue.drain(..n).collect();
            let pkt = self.sender.send(
                self.conn_id,
                payload,
                self.receiver.ack_number(),
                self.receiver.window_size(),
            );
            transmit(cb, Some(self.handle), &pkt, self.peer);
            // Data segments piggyback the cumulative ACK.
            self.ack_pending = false;
        }
        if self.close_requested
            && self.fin.is_none()
            && self.send_queue.is_empty()
            && !self.sender.has_unacked()
        {
            let fin = self.control(flags::FIN | flags::ACK);
            transmit(cb, Some(self.handle), &fin, self.peer);
            self.fin = Some(Control {
                packet: fin,
                sent_at: Instant::now(),
                tries: 1,
            });
        }
    }

    fn finished(&self, now: Instant, linger: Duration) -> bool {
        if !self.close_requested {
            return false;
        }
        match self.phase {
            Phase::SynSent | Phase::Failed => true,
            Phase::Established => self
                .fin_acked_at
                .map_or(false, |at| self.peer_fin || now.duration_since(at) >= linger),
        }
    }
}

// ---------------------------------------------------------------------------
// ArqEngine
// ---------------------------------------------------------------------------

/// Reference engine; see the module docs.
#[derive(Debug)]
pub struct ArqEngine {
    options: EngineOptions,
    config: ArqConfig,
    next_handle: u32,
    /// Created but not yet connected.
    idle: HashSet<SocketHandle>,
    conns: HashMap<SocketHandle, Conn>,
    routes: HashMap<(SocketAddr, u16), SocketHandle>,
    destroyed: bool,
}

impl ArqEngine {
    /// Context-init.
    pub fn new(options: EngineOptions) -> Self {
        Self::with_config(options, ArqConfig::default())
    }

    pub fn with_config(options: EngineOptions, config: ArqConfig) -> Self {
        Self {
            options,
            config,
            next_handle: 1,
            idle: HashSet::new(),
            conns: HashMap::new(),
            routes: HashMap::new(),
            destroyed: false,
        }
    }

    /// Number of live (connecting, connected or closing) sockets.
    pub fn live_sockets(&self) -> usize {
        self.idle.len() + self.conns.len()
    }

    fn alloc_handle(&mut self) -> SocketHandle {
        let handle = SocketHandle(self.next_handle);
        self.next_handle = self.next_handle.wrapping_add(1).max(1);
        handle
    }

    /// Remove every socket whose teardown completed and report DESTROYING.
    fn reap(&mut self, cb: &mut dyn EngineCallbacks, now: Instant) {
        let linger = self.config.linger;
        let done: Vec<SocketHandle> = self
            .conns
            .values()
            .filter(|c| c.finished(now, linger))
            .map(|c| c.handle)
            .collect();
        for handle in done {
            if let Some(conn) = self.conns.remove(&handle) {
                self.routes.remove(&(conn.peer, conn.conn_id));
                emit(self.options.log_normal, cb, Some(handle), || {
                    format!("socket {handle} destroyed")
                });
                cb.on_state_change(handle, EngineState::Destroying);
            }
        }
    }

    fn on_syn(&mut self, from: SocketAddr, pkt: Packet, cb: &mut dyn EngineCallbacks) {
        let h = &pkt.header;
        if !cb.on_firewall(from) {
            emit(self.options.log_normal, cb, None, || {
                format!("firewalled connection attempt from {from}")
            });
            let rst = Packet::control(h.conn_id, 0, h.seq.wrapping_add(1), flags::RST, 0);
            transmit(cb, None, &rst, from);
            return;
        }

        let handle = self.alloc_handle();
        let isn: u32 = rand::thread_rng().gen();
        let mut conn = Conn::new(
            handle,
            from,
            h.conn_id,
            Phase::Established,
            isn,
            h.seq.wrapping_add(1),
            &self.config,
            &self.options,
        );
        let syn_ack = Packet::control(
            h.conn_id,
            isn,
            conn.receiver.ack_number(),
            flags::SYN | flags::ACK,
            conn.receiver.window_size(),
        );
        conn.syn = Some(Control {
            packet: syn_ack.clone(),
            sent_at: Instant::now(),
            tries: 1,
        });
        self.routes.insert((from, h.conn_id), handle);
        self.conns.insert(handle, conn);

        emit(self.options.log_normal, cb, Some(handle), || {
            format!("accepted {from} conn_id={} as {handle}", pkt.header.conn_id)
        });
        cb.on_accept(handle, from);
        log_segment_size(&self.options, &self.config, cb, handle);
        transmit(cb, Some(handle), &syn_ack, from);
    }

    fn on_segment(&mut self, handle: SocketHandle, pkt: Packet, cb: &mut dyn EngineCallbacks) {
        let Self {
            options,
            config,
            conns,
            ..
        } = self;
        let Some(conn) = conns.get_mut(&handle) else {
            return;
        };
        let h = &pkt.header;
        let now = Instant::now();

        if h.has(flags::RST) {
            if conn.phase != Phase::Failed {
                let error = if conn.phase == Phase::SynSent {
                    TransportError::ConnectionRefused
                } else {
                    TransportError::ConnectionReset
                };
                conn.phase = Phase::Failed;
                cb.on_error(handle, error);
            }
            return;
        }

        match conn.phase {
            Phase::Failed => {}
            Phase::SynSent => {
                if h.has(flags::SYN) && h.has(flags::ACK) && h.ack == conn.sender.next_seq {
                    conn.receiver = GbnReceiver::new(h.seq.wrapping_add(1), options.recv_buffer);
                    conn.phase = Phase::Established;
                    if let Some(syn) = conn.syn.take() {
                        if syn.tries == 1 {
                            conn.rto.record_rtt_sample(now.duration_since(syn.sent_at));
                        }
                    }
                    conn.send_ack(cb);
                    emit(options.log_normal, cb, Some(handle), || {
                        format!("socket {handle} connected to {}", conn.peer)
                    });
                    cb.on_state_change(handle, EngineState::Connect);
                    log_segment_size(options, config, cb, handle);
                    conn.pump(config, cb);
                }
            }
            Phase::Established => {
                if h.has(flags::SYN) {
                    if h.has(flags::ACK) {
                        // Our ACK of the SYN|ACK was lost.
                        conn.send_ack(cb);
                    } else if let Some(syn) = &conn.syn {
                        transmit(cb, Some(handle), &syn.packet, conn.peer);
                    }
                    return;
                }

                if h.has(flags::ACK) {
                    conn.syn = None;
                    if let Some(acked) = conn.sender.acknowledge(h.ack, now) {
                        conn.retries = 0;
                        match acked.rtt {
                            Some(sample) => conn.rto.record_rtt_sample(sample),
                            None => conn.rto.reset(),
                        }
                        emit(options.log_debug, cb, Some(handle), || {
                            format!("ack={} slid {} segment(s)", h.ack, acked.segments)
                        });
                    }
                    if let Some(fin) = &conn.fin {
                        if conn.fin_acked_at.is_none() && h.ack == fin.packet.header.seq.wrapping_add(1) {
                            conn.fin_acked_at = Some(now);
                        }
                    }
                }

                if !pkt.payload.is_empty() {
                    if conn.receiver.on_segment(h.seq, &pkt.payload) {
                        cb.on_read(handle, &pkt.payload);
                    }
                    conn.ack_pending = true;
                }

                if h.has(flags::FIN) {
                    if conn.receiver.on_fin(h.seq) {
                        conn.send_ack(cb);
                        if !conn.peer_fin {
                            conn.peer_fin = true;
                            cb.on_state_change(handle, EngineState::Eof);
                        }
                    } else if conn.peer_fin {
                        // Retransmitted FIN: our ACK was lost.
                        conn.send_ack(cb);
                    }
                }

                conn.pump(config, cb);
                if conn.blocked && conn.buffered() < options.send_buffer {
                    conn.blocked = false;
                    cb.on_state_change(handle, EngineState::Writable);
                }
            }
        }
    }
}

impl Engine for ArqEngine {
    fn create_socket(&mut self) -> SocketHandle {
        let handle = self.alloc_handle();
        self.idle.insert(handle);
        handle
    }

    fn connect(
        &mut self,
        handle: SocketHandle,
        to: SocketAddr,
        cb: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        if self.conns.contains_key(&handle) {
            return Err(EngineError::AlreadyConnected(handle));
        }
        if !self.idle.contains(&handle) {
            return Err(EngineError::UnknownHandle(handle));
        }
        if to.port() == 0 || to.ip().is_unspecified() {
            return Err(EngineError::InvalidAddress(to.to_string()));
        }
        self.idle.remove(&handle);

        let mut rng = rand::thread_rng();
        let mut conn_id: u16 = rng.gen();
        while self.routes.contains_key(&(to, conn_id)) {
            conn_id = conn_id.wrapping_add(1);
        }
        let isn: u32 = rng.gen();

        let mut conn = Conn::new(
            handle,
            to,
            conn_id,
            Phase::SynSent,
            isn,
            0,
            &self.config,
            &self.options,
        );
        let syn = Packet::control(conn_id, isn, 0, flags::SYN, conn.receiver.window_size());
        transmit(cb, Some(handle), &syn, to);
        conn.syn = Some(Control {
            packet: syn,
            sent_at: Instant::now(),
            tries: 1,
        });
        self.routes.insert((to, conn_id), handle);
        self.conns.insert(handle, conn);
        emit(self.options.log_normal, cb, Some(handle), || {
            format!("socket {handle} connecting to {to} conn_id={conn_id}")
        });
        Ok(())
    }

    fn write(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
        cb: &mut dyn EngineCallbacks,
    ) -> Result<usize, EngineError> {
        if self.destroyed {
            return Err(EngineError::Destroyed);
        }
        let Some(conn) = self.conns.get_mut(&handle) else {
            if self.idle.contains(&handle) {
                return Ok(0);
            }
            return Err(EngineError::UnknownHandle(handle));
        };
        if conn.close_requested || conn.phase != Phase::Established {
            return Ok(0);
        }
        let room = self.options.send_buffer.saturating_sub(conn.buffered());
        let accepted = room.min(data.len());
        conn.send_queue.extend(&data[..accepted]);
        conn.pump(&self.config, cb);
        if accepted < data.len() {
            conn.blocked = true;
        }
        Ok(accepted)
    }

    fn read_drained(&mut self, handle: SocketHandle) {
        if let Some(conn) = self.conns.get_mut(&handle) {
            conn.receiver.drained();
        }
    }

    fn close(&mut self, handle: SocketHandle, cb: &mut dyn EngineCallbacks) {
        if self.destroyed {
            return;
        }
        if self.idle.remove(&handle) {
            cb.on_state_change(handle, EngineState::Destroying);
            return;
        }
        let Some(conn) = self.conns.get_mut(&handle) else {
            log::debug!("[arq] close on unknown socket {handle}");
            return;
        };
        if conn.close_requested {
            return;
        }
        conn.close_requested = true;
        match conn.phase {
            Phase::SynSent => {
                let rst = conn.control(flags::RST);
                transmit(cb, Some(handle), &rst, conn.peer);
            }
            Phase::Established => conn.pump(&self.config, cb),
            Phase::Failed => {}
        }
        self.reap(cb, Instant::now());
    }

    fn process_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        cb: &mut dyn EngineCallbacks,
    ) -> bool {
        if self.destroyed {
            return false;
        }
        let pkt = match Packet::decode(datagram) {
            Ok(pkt) => pkt,
            Err(e) => {
                log::debug!("[arq] dropping {} byte datagram from {from}: {e}", datagram.len());
                return false;
            }
        };
        let h = &pkt.header;
        match self.routes.get(&(from, h.conn_id)).copied() {
            Some(handle) => self.on_segment(handle, pkt, cb),
            None if h.has(flags::SYN) && !h.has(flags::ACK) => self.on_syn(from, pkt, cb),
            None if !h.has(flags::RST) => {
                let rst = Packet::control(h.conn_id, h.ack, h.seq.wrapping_add(1), flags::RST, 0);
                transmit(cb, None, &rst, from);
            }
            None => {}
        }
        self.reap(cb, Instant::now());
        true
    }

    fn issue_deferred_acks(&mut self, cb: &mut dyn EngineCallbacks) {
        for conn in self.conns.values_mut() {
            if conn.ack_pending && conn.phase == Phase::Established {
                conn.send_ack(cb);
            }
        }
    }

    fn check_timeouts(&mut self, cb: &mut dyn EngineCallbacks) {
        if self.destroyed {
            return;
        }
        let now = Instant::now();
        let max_retries = self.config.max_retries;
        for conn in self.conns.values_mut() {
            let handle = conn.handle;
            let rto = conn.rto.current_rto;
            match conn.phase {
                Phase::SynSent => {
                    let Some(syn) = conn.syn.as_mut() else { continue };
                    if now.duration_since(syn.sent_at) < rto {
                        continue;
                    }
                    if syn.tries > max_retries {
                        conn.phase = Phase::Failed;
                        cb.on_error(handle, TransportError::TimedOut);
                        continue;
                    }
                    transmit(cb, Some(handle), &syn.packet, conn.peer);
                    syn.tries += 1;
                    syn.sent_at = now;
                    conn.rto.back_off();
                }
                Phase::Established => {
                    if let Some(oldest) = conn.sender.oldest_sent_at() {
                        if now.duration_since(oldest) < rto {
                            continue;
                        }
                        conn.retries += 1;
                        if conn.retries > max_retries {
                            conn.phase = Phase::Failed;
                            cb.on_error(handle, TransportError::TimedOut);
                            continue;
                        }
                        emit(self.options.log_debug, cb, Some(handle), || {
                            format!("timeout, retransmitting {} segment(s)", conn.sender.in_flight())
                        });
                        for packet in conn.sender.go_back(now) {
                            transmit(cb, Some(handle), &packet, conn.peer);
                        }
                        conn.rto.back_off();
                    } else if conn.fin_acked_at.is_none() {
                        let Some(fin) = conn.fin.as_mut() else { continue };
                        if now.duration_since(fin.sent_at) < rto {
                            continue;
                        }
                        if fin.tries > max_retries {
                            conn.phase = Phase::Failed;
                            cb.on_error(handle, TransportError::TimedOut);
                            continue;
                        }
                        transmit(cb, Some(handle), &fin.packet, conn.peer);
                        fin.tries += 1;
                        fin.sent_at = now;
                        conn.rto.back_off();
                    }
                }
                Phase::Failed => {}
            }
        }
        self.reap(cb, now);
    }

    fn destroy(&mut self) {
        self.idle.clear();
        self.conns.clear();
        self.routes.clear();
        self.destroyed = true;
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
