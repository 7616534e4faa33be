//! Connection lifecycle state machine.
//!
//! Pure bookkeeping; the endpoint decides what each transition triggers.
//!
//! ```text
//!  CONNECTING ──CONNECT/WRITABLE──▶ ESTABLISHED ──DESTROYING──▶ DESTROYED
//!       │                              │   ▲
//!       │                              │   └── WRITABLE (restores writability)
//!       └──────────DESTROYING──────────┼──────────────────────▶ DESTROYED
//!                                      │
//!             flags, independent of the phase:
//!               eof_received  (peer finished sending)
//!               closing       (local close requested; writes rejected)
//!               close_sent    (engine close actually issued)
//! ```
//!
//! Invalid transitions come back as `Err(reason)` so the caller can report a
//! protocol violation.

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Connecting,
    Established,
    Destroyed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug)]
pub struct Lifecycle {
    phase: Phase,
    /// The engine accepts writes right now.
    pub writable: bool,
    pub eof_received: bool,
    pub closing: bool,
    pub close_sent: bool,
    /// First recorded error; handed to `connection_lost`.
    error: Option<Error>,
}

impl Lifecycle {
    /// Outbound connection, waiting for CONNECT.
    pub fn connecting() -> Self {
        Self {
            phase: Phase::Connecting,
            writable: false,
            eof_received: false,
            closing: false,
            close_sent: false,
            error: None,
        }
    }

    /// Inbound connection; usable as soon as it is accepted.
    pub fn accepted() -> Self {
        Self {
            phase: Phase::Established,
            writable: true,
            ..Self::connecting()
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_destroyed(&self) -> bool {
        self.phase == Phase::Destroyed
    }

    /// CONNECT or WRITABLE.  Returns `Ok(true)` on the transition into
    /// ESTABLISHED, `Ok(false)` when only writability was restored.
    pub fn on_writable(&mut self) -> Result<bool, String> {
        match self.phase {
            Phase::Destroyed => Err("CONNECT/WRITABLE after DESTROYING".into()),
            Phase::Connecting => {
                self.phase = Phase::Established;
                self.writable = true;
                Ok(true)
            }
            Phase::Established => {
                self.writable = true;
                Ok(false)
            }
        }
    }

    /// EOF.  Returns `Ok(true)` the first time only.
    pub fn on_eof(&mut self) -> Result<bool, String> {
        if self.is_destroyed() {
            return Err("EOF after DESTROYING".into());
        }
        let first = !self.eof_received;
        self.eof_received = true;
        Ok(first)
    }

    pub fn on_destroying(&mut self) -> Result<(), String> {
        if self.is_destroyed() {
            return Err("duplicate DESTROYING".into());
        }
        self.phase = Phase::Destroyed;
        self.writable = false;
        Ok(())
    }

    /// Record `error` unless one is already recorded.  Returns whether it was.
    pub fn record_error(&mut self, error: Error) -> bool {
        if self.error.is_some() {
            return false;
        }
        self.error = Some(error);
        true
    }

    pub fn take_error(&mut self) -> Option<Error> {
        self.error.take()
    }

    /// Why a new write must be refused, if it must.
    pub fn check_writable(&self) -> Result<(), Error> {
        if self.is_destroyed() {
            Err(Error::Closed)
        } else if self.closing {
            Err(Error::Closing)
        } else {
            Ok(())
        }
    }
}
