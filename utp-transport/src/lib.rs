//! `utp-transport`: stream connections multiplexed over one UDP socket by a
//! callback-driven transport engine.
//!
//! # Architecture
//!
//! ```text
//!   Protocol handlers        Connection / Listener handles
//!          ▲                          │ commands
//!          │ deferred events          ▼
//!  ┌───────┴──────────────────────────────────────┐
//!  │              endpoint task                   │
//!  │   Core: slots, handle map, outbound queue    │
//!  └───────┬──────────────────────────▲───────────┘
//!          │ imperative calls         │ callbacks
//!  ┌───────▼──────────────────────────┴───────────┐
//!  │        Box<dyn Engine>  (e.g. ArqEngine)     │
//!  └───────┬──────────────────────────────────────┘
//!          │ datagrams
//!  ┌───────▼──────┐
//!  │ UDP socket   │  (one per client / listener)
//!  └──────────────┘
//! ```
//!
//! Each module has a single responsibility:
//! - [`engine`]      engine capability traits and the reference [`ArqEngine`]
//! - [`addr`]        `(host, port)` ⇄ native address codec
//! - [`connection`]  connection handles, write path, outbound connect
//! - [`listener`]    accept gate, accept policies, two-phase shutdown
//! - [`protocol`]    application handler trait and the event-stream adapter
//! - [`config`]      endpoint configuration
//! - [`error`]       error taxonomy
//!
//! # Example
//!
//! ```no_run
//! use utp_transport::{open_connection, EndpointConfig, Event};
//!
//! # async fn demo() -> utp_transport::Result<()> {
//! let (conn, mut events) =
//!     open_connection("127.0.0.1:9000".parse().unwrap(), EndpointConfig::default()).await?;
//! conn.write(b"hello\n").await?;
//! while let Some(event) = events.next().await {
//!     if let Event::Data(bytes) = event {
//!         println!("{}", String::from_utf8_lossy(&bytes));
//!         conn.close();
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod addr;
pub mod config;
pub mod connection;
mod endpoint;
pub mod engine;
pub mod error;
pub mod listener;
pub mod protocol;
mod socket;
mod state;

pub use addr::PeerName;
pub use config::{EndpointConfig, WriteStallPolicy};
pub use connection::{
    connect, connect_host, connect_with_engine, open_connection, Connection, ConnectionRef,
    WriteStatus,
};
pub use engine::arq::{ArqConfig, ArqEngine};
pub use engine::{Engine, EngineCallbacks, EngineOptions, EngineState, SocketHandle};
pub use error::{EngineError, Error, Result, TransportError};
pub use listener::{AcceptAll, AcceptPolicy, Listener, ProtocolFactory, SinglePeer};
pub use protocol::{ChannelProtocol, Event, EventStream, Protocol};
