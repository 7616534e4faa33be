//! Application protocol handlers.
//!
//! A [`Protocol`] receives the events of exactly one connection, in order:
//!
//! ```text
//!  connection_made ─▶ data_received* ─▶ eof_received? ─▶ connection_lost
//! ```
//!
//! `connection_made` is skipped when an outbound connect never completes;
//! `connection_lost` is always delivered, exactly once, last.  Handlers run
//! on the endpoint task but never inside an engine call, so they may freely
//! write to or close the connection through the [`ConnectionRef`] they are
//! given.
//!
//! [`ChannelProtocol`] adapts the callback style to a stream of [`Event`]s.

use tokio::sync::mpsc;

use crate::connection::ConnectionRef;
use crate::error::{Error, Result};

pub trait Protocol: Send + 'static {
    fn connection_made(&mut self, _conn: &mut ConnectionRef<'_>) {}

    fn data_received(&mut self, _conn: &mut ConnectionRef<'_>, _data: &[u8]) {}

    /// The peer finished sending.  Return `true` to keep the half-open
    /// connection for writing; `false` closes it.
    fn eof_received(&mut self, _conn: &mut ConnectionRef<'_>) -> bool {
        false
    }

    /// Terminal.  `error` is the first error recorded on the connection.
    fn connection_lost(&mut self, _conn: &mut ConnectionRef<'_>, _error: Option<Error>) {}
}

/// A connection event, as delivered by [`EventStream`].
#[derive(Debug, Clone)]
pub enum Event {
    Established,
    Data(Vec<u8>),
    Eof,
    Lost(Option<Error>),
}

/// Forwards every event into an [`EventStream`].
///
/// EOF is forwarded and the connection is closed from our side too;
/// construct with [`ChannelProtocol::half_open`] to keep writing after EOF.
#[derive(Debug)]
pub struct ChannelProtocol {
    events: mpsc::UnboundedSender<Event>,
    keep_open_on_eof: bool,
}

impl ChannelProtocol {
    pub fn new() -> (Self, EventStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let protocol = Self {
            events: tx,
            keep_open_on_eof: false,
        };
        (protocol, EventStream { events: rx })
    }

    pub fn half_open() -> (Self, EventStream) {
        let (mut protocol, stream) = Self::new();
        protocol.keep_open_on_eof = true;
        (protocol, stream)
    }

    fn forward(&self, event: Event) {
        // A dropped stream just means nobody is listening any more.
        let _ = self.events.send(event);
    }
}

impl Protocol for ChannelProtocol {
    fn connection_made(&mut self, _conn: &mut ConnectionRef<'_>) {
        self.forward(Event::Established);
    }

    fn data_received(&mut self, _conn: &mut ConnectionRef<'_>, data: &[u8]) {
        self.forward(Event::Data(data.to_vec()));
    }

    fn eof_received(&mut self, _conn: &mut ConnectionRef<'_>) -> bool {
        self.forward(Event::Eof);
        self.keep_open_on_eof
    }

    fn connection_lost(&mut self, _conn: &mut ConnectionRef<'_>, error: Option<Error>) {
        self.forward(Event::Lost(error));
    }
}

/// Receiving half of a [`ChannelProtocol`].
#[derive(Debug)]
pub struct EventStream {
    events: mpsc::UnboundedReceiver<Event>,
}

impl EventStream {
    /// Next event; `None` once `Lost` has been taken and the connection is gone.
    pub async fn next(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    /// Collect payload until EOF or loss.
    ///
    /// Returns the error carried by `Lost`, if any, instead of the data.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(event) = self.next().await {
            match event {
                Event::Established => {}
                Event::Data(data) => out.extend_from_slice(&data),
                Event::Eof | Event::Lost(None) => return Ok(out),
                Event::Lost(Some(e)) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Wait for the terminal event, discarding anything before it.
    pub async fn lost(&mut self) -> Option<Error> {
        while let Some(event) = self.next().await {
            if let Event::Lost(error) = event {
                return error;
            }
        }
        None
    }
}
