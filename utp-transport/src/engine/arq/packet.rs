//! Segment codec for [`super::ArqEngine`].
//!
//! Pure data transformation: a [`Packet`] in, bytes out, and back.
//!
//! ```text
//!  offset  size  field
//!  ------  ----  ----------------------------------------------
//!       0     2  conn_id      chosen by the connecting side
//!       2     4  seq          first payload byte, or SYN/FIN
//!       6     4  ack          next sequence number expected
//!      10     1  flags        SYN | ACK | FIN | RST
//!      11     2  window       advertised receive window (bytes)
//!      13     2  length       payload length
//!      15     2  checksum     RFC 1071 over header + payload
//!      17     *  payload
//! ```
//!
//! Integers travel in network byte order.  `(peer address, conn_id)` names
//! one logical connection on a shared UDP socket.

use thiserror::Error;

pub mod flags {
    pub const SYN: u8 = 1 << 0;
    pub const ACK: u8 = 1 << 1;
    pub const FIN: u8 = 1 << 2;
    pub const RST: u8 = 1 << 3;
}

pub const HEADER_LEN: usize = 17;

const CHECKSUM_AT: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub conn_id: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    /// Receive window the sender can still absorb.
    pub window: u16,
}

impl Header {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag == flag
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("datagram of {0} bytes cannot hold a header")]
    Truncated(usize),
    #[error("header announces {declared} payload bytes, datagram carries {actual}")]
    BadLength { declared: usize, actual: usize },
    #[error("checksum mismatch")]
    BadChecksum,
}

impl Packet {
    /// A payload-less segment: SYN, ACK, FIN, RST or a combination.
    pub fn control(conn_id: u16, seq: u32, ack: u32, flags: u8, window: u16) -> Self {
        Self {
            header: Header {
                conn_id,
                seq,
                ack,
                flags,
                window,
            },
            payload: Vec::new(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let h = &self.header;
        let mut out = Vec::with_capacity(HEADER_LEN + self.payload.len());
        out.extend_from_slice(&h.conn_id.to_be_bytes());
        out.extend_from_slice(&h.seq.to_be_bytes());
        out.extend_from_slice(&h.ack.to_be_bytes());
        out.push(h.flags);
        out.extend_from_slice(&h.window.to_be_bytes());
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.payload);

        let sum = checksum(&out);
        out[CHECKSUM_AT..CHECKSUM_AT + 2].copy_from_slice(&sum.to_be_bytes());
        out
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if datagram.len() < HEADER_LEN {
            return Err(PacketError::Truncated(datagram.len()));
        }
        let mut r = Reader(datagram);
        let header = Header {
            conn_id: r.u16(),
            seq: r.u32(),
            ack: r.u32(),
            flags: r.u8(),
            window: r.u16(),
        };
        let declared = usize::from(r.u16());
        r.u16();
        let payload = r.0;

        if declared != payload.len() {
            return Err(PacketError::BadLength {
                declared,
                actual: payload.len(),
            });
        }
        // A valid datagram, checksum field included, folds to zero.
        if checksum(datagram) != 0 {
            return Err(PacketError::BadChecksum);
        }
        Ok(Self {
            header,
            payload: payload.to_vec(),
        })
    }
}

/// Big-endian cursor over a slice already known to be long enough.
struct Reader<'a>(&'a [u8]);

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> [u8; N] {
        let (head, rest) = self.0.split_at(N);
        self.0 = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        out
    }

    fn u8(&mut self) -> u8 {
        self.take::<1>()[0]
    }

    fn u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    fn u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }
}

/// RFC 1071 ones' complement sum.  An odd trailing byte is zero-padded.
fn checksum(bytes: &[u8]) -> u16 {
    let folded = bytes
        .chunks(2)
        .map(|pair| match *pair {
            [hi, lo] => u32::from(u16::from_be_bytes([hi, lo])),
            [hi] => u32::from(hi) << 8,
            _ => 0,
        })
        .fold(0u32, |acc, word| {
            let acc = acc + word;
            (acc & 0xffff) + (acc >> 16)
        });
    !(folded as u16)
}
