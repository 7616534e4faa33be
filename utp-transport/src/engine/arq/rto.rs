//! Retransmission timeout estimation.
//!
//! RTO follows a variant of Jacobson's algorithm (RFC 6298):
//!   `RTO = SRTT + 4 × RTTVAR`
//! and doubles on each consecutive timeout up to a configured maximum.
//! Only segments transmitted exactly once are sampled (Karn's rule); the
//! engine enforces that before calling [`RetransmitTimer::record_rtt_sample`].

use std::time::Duration;

/// Floor for estimated RTOs; loopback samples are close to zero.
const MIN_RTO: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial_rto: Duration,
    max_rto: Duration,
    /// Current RTO, updated after each RTT sample or back-off.
    pub current_rto: Duration,
    pub srtt: Option<Duration>,
    pub rttvar: Option<Duration>,
}

impl RetransmitTimer {
    pub fn new(initial_rto: Duration, max_rto: Duration) -> Self {
        Self {
            initial_rto,
            max_rto,
            current_rto: initial_rto,
            srtt: None,
            rttvar: None,
        }
    }

    /// Record a new RTT sample and update SRTT / RTTVAR / RTO (RFC 6298 §2).
    ///
    /// On the first sample:  SRTT = R,  RTTVAR = R/2.
    /// Subsequent samples:   RTTVAR = 3/4·RTTVAR + 1/4·|SRTT − R|
    ///                       SRTT   = 7/8·SRTT   + 1/8·R
    pub fn record_rtt_sample(&mut self, sample: Duration) {
        match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = Some(rttvar * 3 / 4 + diff / 4);
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
            _ => {
                self.srtt = Some(sample);
                self.rttvar = Some(sample / 2);
            }
        }
        self.reset();
    }

    /// Double the RTO after a retransmission timeout (RFC 6298 §5.5).
    pub fn back_off(&mut self) {
        self.current_rto = (self.current_rto * 2).min(self.max_rto);
    }

    /// Restore `current_rto` from the estimates, or `initial_rto` before the
    /// first sample.
    pub fn reset(&mut self) {
        self.current_rto = match (self.srtt, self.rttvar) {
            (Some(srtt), Some(rttvar)) => (srtt + rttvar * 4).clamp(MIN_RTO, self.max_rto.max(MIN_RTO)),
            _ => self.initial_rto,
        };
    }
}
