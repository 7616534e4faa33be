//! Send half of a connection: the Go-Back-N retransmit window.
//!
//! ```text
//!     base                 next_seq
//!      │ <── in flight ──▶ │ <── free slots ──▶
//!  ────┼───────────────────┼───────────────────▶ seq space
//! ```
//!
//! ACKs are cumulative.  A timeout resends the whole window, oldest first.
//! Sequence numbers wrap; see [`seq_le`].

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use super::packet::{flags, Packet};

/// `a <= b` in wrap-around sequence space.
pub(crate) fn seq_le(a: u32, b: u32) -> bool {
    b.wrapping_sub(a) < 1 << 31
}

#[derive(Debug)]
struct InFlight {
    packet: Packet,
    /// Only segments sent exactly once yield RTT samples (Karn).
    retransmitted: bool,
    sent_at: Instant,
}

impl InFlight {
    fn end(&self) -> u32 {
        self.packet
            .header
            .seq
            .wrapping_add(self.packet.payload.len() as u32)
    }
}

/// Result of an ACK that moved the window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acked {
    pub segments: usize,
    /// RTT of the newest acknowledged segment, if it was never resent.
    pub rtt: Option<Duration>,
}

#[derive(Debug)]
pub struct GbnSender {
    base: u32,
    pub next_seq: u32,
    capacity: usize,
    window: VecDeque<InFlight>,
}

impl GbnSender {
    /// `first_seq` is ISN + 1; the window holds at least one segment.
    pub fn new(first_seq: u32, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            base: first_seq,
            next_seq: first_seq,
            capacity,
            window: VecDeque::with_capacity(capacity),
        }
    }

    pub fn can_send(&self) -> bool {
        self.window.len() < self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.window.len()
    }

    pub fn bytes_in_flight(&self) -> usize {
        self.window.iter().map(|s| s.packet.payload.len()).sum()
    }

    pub fn has_unacked(&self) -> bool {
        !self.window.is_empty()
    }

    /// Put `payload` in the next window slot and return the segment to
    /// transmit.  The caller checks [`can_send`](Self::can_send) first.
    pub fn send(&mut self, conn_id: u16, payload: Vec<u8>, ack: u32, rwnd: u16) -> Packet {
        let packet = Packet {
            payload,
            ..Packet::control(conn_id, self.next_seq, ack, flags::ACK, rwnd)
        };
        let segment = InFlight {
            packet: packet.clone(),
            retransmitted: false,
            sent_at: Instant::now(),
        };
        self.next_seq = segment.end();
        self.window.push_back(segment);
        packet
    }

    /// Slide the window up to the cumulative `ack`.  `None` for duplicate or
    /// out-of-range ACKs.
    pub fn acknowledge(&mut self, ack: u32, now: Instant) -> Option<Acked> {
        if !seq_le(self.base, ack) || !seq_le(ack, self.next_seq) {
            return None;
        }
        let mut acked = Acked {
            segments: 0,
            rtt: None,
        };
        while self.window.front().map_or(false, |s| seq_le(s.end(), ack)) {
            let Some(segment) = self.window.pop_front() else {
                break;
            };
            self.base = segment.end();
            acked.segments += 1;
            acked.rtt = (!segment.retransmitted).then(|| now.duration_since(segment.sent_at));
        }
        (acked.segments > 0).then_some(acked)
    }

    /// Segments to resend on timeout, oldest first; marks them retransmitted.
    pub fn go_back(&mut self, now: Instant) -> Vec<Packet> {
        self.window
            .iter_mut()
            .map(|s| {
                s.retransmitted = true;
                s.sent_at = now;
                s.packet.clone()
            })
            .collect()
    }

    /// Last transmission of the oldest unacked segment.
    pub fn oldest_sent_at(&self) -> Option<Instant> {
        self.window.front().map(|s| s.sent_at)
    }
}
