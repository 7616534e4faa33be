//! Non-blocking UDP plumbing for the endpoint task.
//!
//! [`DatagramSocket`] wraps `tokio::net::UdpSocket` and exposes the two
//! readiness-driven operations the endpoint needs: draining every pending
//! inbound datagram and flushing the outbound queue.  Both stop at
//! would-block, which means "drained", never failure.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;

use tokio::net::UdpSocket;

/// FIFO of `(payload, destination)` awaiting the wire.
pub type OutboundQueue = VecDeque<(Vec<u8>, SocketAddr)>;

/// Returns `true` for errors that do not indicate a broken socket.
///
/// On some platforms an ICMP "port unreachable" for an earlier send is
/// reported on the next receive as `ConnectionReset` / `ConnectionRefused`.
/// The socket itself is fine; the engine notices the dead peer on its own.
pub fn is_transient_io_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused | io::ErrorKind::Interrupted
    )
}

#[derive(Debug)]
pub struct DatagramSocket {
    local_addr: SocketAddr,
    inner: UdpSocket,
}

impl DatagramSocket {
    /// Bind to `addr`; port 0 lets the OS choose.
    pub async fn bind(addr: SocketAddr) -> io::Result<Self> {
        let inner = UdpSocket::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        Ok(Self { local_addr, inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn readable(&self) -> io::Result<()> {
        self.inner.readable().await
    }

    pub async fn writable(&self) -> io::Result<()> {
        self.inner.writable().await
    }

    /// Hand every queued inbound datagram to `deliver` until the socket
    /// would block or `deliver` returns `false`.
    pub fn drain<F>(&self, buf: &mut [u8], mut deliver: F) -> io::Result<usize>
    where
        F: FnMut(&[u8], SocketAddr) -> bool,
    {
        let mut count = 0;
        loop {
            match self.inner.try_recv_from(buf) {
                Ok((n, from)) => {
                    count += 1;
                    if !deliver(&buf[..n], from) {
                        return Ok(count);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(count),
                Err(e) if is_transient_io_error(&e) => {
                    log::debug!("[socket] ignoring transient receive error: {e}");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send queued datagrams in order until the queue is empty or the socket
    /// would block.  A short send is reported as an error.
    pub fn flush(&self, queue: &mut OutboundQueue) -> io::Result<()> {
        while let Some((payload, to)) = queue.front() {
            match self.inner.try_send_to(payload, *to) {
                Ok(n) if n == payload.len() => {
                    queue.pop_front();
                }
                Ok(n) => {
                    return Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("short send to {to}: {n} of {} bytes", payload.len()),
                    ));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if is_transient_io_error(&e) => {
                    log::debug!("[socket] dropping datagram to {to}: {e}");
                    queue.pop_front();
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn icmp_errors_are_transient() {
        assert!(is_transient_io_error(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(is_transient_io_error(&io::Error::from(io::ErrorKind::ConnectionRefused)));
        assert!(!is_transient_io_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[tokio::test]
    async fn flush_then_drain_over_loopback() {
        let a = DatagramSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = DatagramSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let mut queue = OutboundQueue::new();
        queue.push_back((b"one".to_vec(), b.local_addr()));
        queue.push_back((b"two".to_vec(), b.local_addr()));
        a.flush(&mut queue).unwrap();
        assert!(queue.is_empty());

        let mut got = Vec::new();
        let mut buf = [0u8; 64];
        while got.len() < 2 {
            b.readable().await.unwrap();
            b.drain(&mut buf, |d, from| {
                assert_eq!(from, a.local_addr());
                got.push(d.to_vec());
                true
            })
            .unwrap();
        }
        assert_eq!(got, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn drain_on_idle_socket_returns_zero() {
        let s = DatagramSocket::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(s.drain(&mut buf, |_, _| true).unwrap(), 0);
    }
}
