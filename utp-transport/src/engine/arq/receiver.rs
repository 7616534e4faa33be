//! Go-Back-N receive-side state machine.
//!
//! - Only **in-order** segments are accepted (seq == `rcv_nxt`).
//! - Out-of-order or duplicate segments are discarded.
//! - A segment that would overflow the receive buffer is discarded too; the
//!   sender retransmits it once the application has drained what it holds.
//!
//! After every segment the engine owes the peer a cumulative ACK carrying
//! [`GbnReceiver::ack_number`].

#[derive(Debug)]
pub struct GbnReceiver {
    /// Next expected sequence number (`RCV.NXT`).
    pub rcv_nxt: u32,
    /// Delivered bytes the application has not reported as drained.
    unread: usize,
    capacity: usize,
}

impl GbnReceiver {
    pub fn new(rcv_nxt: u32, capacity: usize) -> Self {
        Self {
            rcv_nxt,
            unread: 0,
            capacity,
        }
    }

    /// Returns `true` if the segment was accepted and must be delivered.
    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> bool {
        if seq != self.rcv_nxt || self.unread + payload.len() > self.capacity {
            return false;
        }
        self.rcv_nxt = self.rcv_nxt.wrapping_add(payload.len() as u32);
        self.unread += payload.len();
        true
    }

    /// Advance past a FIN (which consumes one sequence number).
    ///
    /// Returns `true` if the FIN was in order.
    pub fn on_fin(&mut self, fin_seq: u32) -> bool {
        if fin_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            true
        } else {
            false
        }
    }

    /// The application consumed everything delivered so far.
    pub fn drained(&mut self) {
        self.unread = 0;
    }

    pub fn ack_number(&self) -> u32 {
        self.rcv_nxt
    }

    /// Advertised receive window, saturated to the header field width.
    pub fn window_size(&self) -> u16 {
        self.capacity
            .saturating_sub(self.unread)
            .min(u16::MAX as usize) as u16
    }
}
