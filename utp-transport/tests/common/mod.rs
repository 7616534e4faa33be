//! Shared fixtures for the integration tests.
//!
//! [`ScriptEngine`] is an engine whose callbacks are scripted from outside:
//! every datagram it receives is a `;`-separated list of commands, each
//! turned into one callback within the same `process_datagram` call.
//!
//! ```text
//!  accept <h>          on_firewall, then on_accept if admitted
//!  force-accept <h>    on_accept without asking the firewall
//!  connect <h>         on_state_change(CONNECT)
//!  writable <h>        on_state_change(WRITABLE)
//!  eof <h>             on_state_change(EOF)
//!  destroy <h>         on_state_change(DESTROYING)
//!  data <h> <bytes>    on_read
//!  error <h> refused|reset|timeout
//!  broadcast <h>       on_sendto to 255.255.255.255:9, which the socket
//!                      refuses without SO_BROADCAST
//! ```
//!
//! A [`Driver`] socket sends the scripts; the test inspects the recorded
//! engine calls through [`Script`].

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use utp_transport::{
    connect_with_engine, AcceptPolicy, ChannelProtocol, Connection, EndpointConfig, Engine,
    EngineCallbacks, EngineError, EngineState, Event, EventStream, Listener, Protocol,
    SocketHandle, TransportError,
};

pub const WAIT: Duration = Duration::from_secs(3);

/// A destination an unprivileged UDP socket cannot send to.
pub const BROADCAST: &str = "255.255.255.255:9";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Loopback endpoint with a fast tick.
pub fn config() -> EndpointConfig {
    EndpointConfig {
        tick_interval: Duration::from_millis(20),
        ..EndpointConfig::bound_to("127.0.0.1:0".parse().unwrap())
    }
}

// ---------------------------------------------------------------------------
// ScriptEngine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    CreateSocket(SocketHandle),
    Connect(SocketHandle, SocketAddr),
    Write {
        handle: SocketHandle,
        offered: Vec<u8>,
        accepted: usize,
    },
    ReadDrained(SocketHandle),
    Close(SocketHandle),
    Rejected(SocketAddr),
    DeferredAcks,
    Destroy,
}

#[derive(Debug)]
pub struct Shared {
    pub calls: Vec<Call>,
    /// Bytes the engine will still accept; `None` is unlimited.
    pub budget: Option<usize>,
    /// `close` fires DESTROYING before returning.
    pub destroy_on_close: bool,
    pub connect_error: Option<EngineError>,
    /// `close` first sends `bye <h>` here.
    pub farewell: Option<SocketAddr>,
    /// Set while `process_datagram` runs.
    pub in_engine: bool,
    next_handle: u32,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            calls: Vec::new(),
            budget: None,
            destroy_on_close: true,
            connect_error: None,
            farewell: None,
            in_engine: false,
            next_handle: 0,
        }
    }
}

impl Shared {
    /// Every byte the engine accepted on `handle`, in order.
    pub fn written(&self, handle: SocketHandle) -> Vec<u8> {
        self.offers(handle)
            .into_iter()
            .flat_map(|(offered, accepted)| offered[..accepted].to_vec())
            .collect()
    }

    pub fn offers(&self, handle: SocketHandle) -> Vec<(Vec<u8>, usize)> {
        self.calls
            .iter()
            .filter_map(|c| match c {
                Call::Write {
                    handle: h,
                    offered,
                    accepted,
                } if *h == handle => Some((offered.clone(), *accepted)),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, call: &Call) -> usize {
        self.calls.iter().filter(|c| *c == call).count()
    }

    pub fn rejected(&self) -> usize {
        self.calls
            .iter()
            .filter(|c| matches!(c, Call::Rejected(_)))
            .count()
    }
}

/// Test-side view of a [`ScriptEngine`]'s state.
#[derive(Clone)]
pub struct Script(Arc<Mutex<Shared>>);

impl Script {
    pub fn lock(&self) -> MutexGuard<'_, Shared> {
        self.0.lock().unwrap()
    }
}

pub struct ScriptEngine {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptEngine {
    pub fn new() -> (Box<dyn Engine>, Script) {
        let shared = Arc::new(Mutex::new(Shared::default()));
        let engine = Self {
            shared: shared.clone(),
        };
        (Box::new(engine), Script(shared))
    }

    fn record(&self, call: Call) {
        self.shared.lock().unwrap().calls.push(call);
    }
}

impl Engine for ScriptEngine {
    fn create_socket(&mut self) -> SocketHandle {
        let mut shared = self.shared.lock().unwrap();
        shared.next_handle += 1;
        let handle = SocketHandle(shared.next_handle);
        shared.calls.push(Call::CreateSocket(handle));
        handle
    }

    fn connect(
        &mut self,
        handle: SocketHandle,
        to: SocketAddr,
        _cb: &mut dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push(Call::Connect(handle, to));
        match shared.connect_error.clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn write(
        &mut self,
        handle: SocketHandle,
        data: &[u8],
        _cb: &mut dyn EngineCallbacks,
    ) -> Result<usize, EngineError> {
        let mut shared = self.shared.lock().unwrap();
        let accepted = match shared.budget.as_mut() {
            Some(budget) => {
                let n = (*budget).min(data.len());
                *budget -= n;
                n
            }
            None => data.len(),
        };
        shared.calls.push(Call::Write {
            handle,
            offered: data.to_vec(),
            accepted,
        });
        Ok(accepted)
    }

    fn read_drained(&mut self, handle: SocketHandle) {
        self.record(Call::ReadDrained(handle));
    }

    fn close(&mut self, handle: SocketHandle, cb: &mut dyn EngineCallbacks) {
        let (destroy, farewell) = {
            let mut shared = self.shared.lock().unwrap();
            shared.calls.push(Call::Close(handle));
            (shared.destroy_on_close, shared.farewell)
        };
        if let Some(to) = farewell {
            cb.on_sendto(Some(handle), format!("bye {}", handle.0).as_bytes(), to);
        }
        if destroy {
            cb.on_state_change(handle, EngineState::Destroying);
        }
    }

    fn process_datagram(
        &mut self,
        datagram: &[u8],
        from: SocketAddr,
        cb: &mut dyn EngineCallbacks,
    ) -> bool {
        self.shared.lock().unwrap().in_engine = true;
        let recognised = self.run_script(datagram, from, cb);
        self.shared.lock().unwrap().in_engine = false;
        recognised
    }

    fn issue_deferred_acks(&mut self, _cb: &mut dyn EngineCallbacks) {
        self.record(Call::DeferredAcks);
    }

    fn check_timeouts(&mut self, _cb: &mut dyn EngineCallbacks) {}

    fn destroy(&mut self) {
        self.record(Call::Destroy);
    }
}

impl ScriptEngine {
    fn run_script(&self, datagram: &[u8], from: SocketAddr, cb: &mut dyn EngineCallbacks) -> bool {
        let Ok(text) = std::str::from_utf8(datagram) else {
            return false;
        };
        for command in text.split(';') {
            let mut parts = command.trim().splitn(3, ' ');
            let verb = parts.next().unwrap_or_default();
            let Some(handle) = parts.next().and_then(|h| h.parse().ok()).map(SocketHandle) else {
                return false;
            };
            let rest = parts.next().unwrap_or_default();
            match verb {
                "accept" => {
                    if cb.on_firewall(from) {
                        cb.on_accept(handle, from);
                    } else {
                        self.record(Call::Rejected(from));
                    }
                }
                "force-accept" => cb.on_accept(handle, from),
                "connect" => cb.on_state_change(handle, EngineState::Connect),
                "writable" => cb.on_state_change(handle, EngineState::Writable),
                "eof" => cb.on_state_change(handle, EngineState::Eof),
                "destroy" => cb.on_state_change(handle, EngineState::Destroying),
                "data" => cb.on_read(handle, rest.as_bytes()),
                "error" => {
                    let error = match rest {
                        "refused" => TransportError::ConnectionRefused,
                        "reset" => TransportError::ConnectionReset,
                        _ => TransportError::TimedOut,
                    };
                    cb.on_error(handle, error);
                }
                "broadcast" => {
                    cb.on_sendto(Some(handle), b"ping", BROADCAST.parse().unwrap())
                }
                _ => return false,
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Driver + helpers
// ---------------------------------------------------------------------------

/// Sends scripts to an endpoint.
pub struct Driver {
    socket: UdpSocket,
}

impl Driver {
    pub async fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind driver");
        Self { socket }
    }

    pub fn addr(&self) -> SocketAddr {
        self.socket.local_addr().expect("driver addr")
    }

    pub async fn send(&self, to: SocketAddr, script: &str) {
        self.socket
            .send_to(script.as_bytes(), to)
            .await
            .expect("send script");
    }

    /// Next datagram sent to the driver, as text.
    pub async fn recv(&self) -> String {
        let mut buf = [0u8; 1500];
        let (n, _) = timeout(WAIT, self.socket.recv_from(&mut buf))
            .await
            .expect("timed out waiting for datagram")
            .expect("recv");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }
}

/// Client connection over a [`ScriptEngine`]; its handle is always `#1`.
pub async fn connect_scripted(
    config: EndpointConfig,
    driver: &Driver,
    protocol: impl Protocol,
) -> (Connection, Script) {
    let (engine, script) = ScriptEngine::new();
    let conn = connect_with_engine(driver.addr(), config, engine, protocol)
        .await
        .expect("connect");
    (conn, script)
}

/// Stream-style client over a [`ScriptEngine`].
pub async fn open_scripted(driver: &Driver) -> (Connection, EventStream, Script) {
    let (protocol, events) = ChannelProtocol::new();
    let (conn, script) = connect_scripted(config(), driver, protocol).await;
    (conn, events, script)
}

pub type Accepted = mpsc::UnboundedReceiver<(Connection, EventStream)>;

/// Listener over a [`ScriptEngine`], yielding accepted connections as streams.
pub async fn listen_scripted(
    config: EndpointConfig,
    policy: impl AcceptPolicy + 'static,
) -> (Listener, Script, Accepted) {
    let (engine, script) = ScriptEngine::new();
    let (tx, rx) = mpsc::unbounded_channel();
    let listener = Listener::bind_with_engine(config, engine, policy, move |conn: &Connection| -> Box<dyn Protocol> {
        let (protocol, events) = ChannelProtocol::new();
        let _ = tx.send((conn.clone(), events));
        Box::new(protocol)
    })
    .await
    .expect("bind listener");
    (listener, script, rx)
}

pub async fn next_event(events: &mut EventStream) -> Event {
    timeout(WAIT, events.next())
        .await
        .expect("timed out waiting for event")
        .expect("event stream ended")
}

pub async fn next_accepted(accepted: &mut Accepted) -> (Connection, EventStream) {
    timeout(WAIT, accepted.recv())
        .await
        .expect("timed out waiting for accept")
        .expect("listener gone")
}

/// Poll `condition` until it holds.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        sleep(Duration::from_millis(5)).await;
    }
}
