use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::listener::resolve;

/// Bound UDP socket.
///
/// Datagrams are all-or-nothing: a send that the kernel truncates is
/// reported as an error rather than a short count.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
}

impl UdpEndpoint {
    /// Bind the first resolved address that accepts the bind.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut last_err = None;
        for candidate in resolve(addr)? {
            match UdpSocket::bind(candidate) {
                Ok(socket) => {
                    let local_addr = socket.local_addr().map_err(|e| TransportError::Bind {
                        addr: candidate,
                        source: e,
                    })?;
                    info!(%local_addr, "bound udp socket");
                    return Ok(Self { socket, local_addr });
                }
                Err(source) => {
                    debug!(addr = %candidate, error = %source, "udp bind attempt failed");
                    last_err = Some(TransportError::Bind {
                        addr: candidate,
                        source,
                    });
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            TransportError::Resolve(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        }))
    }

    /// Send one datagram to `target` (blocking).
    pub fn send_to(&self, datagram: &[u8], target: SocketAddr) -> Result<()> {
        let sent = self.socket.send_to(datagram, target)?;
        if sent != datagram.len() {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                format!("datagram truncated ({sent} of {} bytes)", datagram.len()),
            )));
        }
        Ok(())
    }

    /// Receive one datagram into `buf` (blocking). Bytes past `buf.len()`
    /// are discarded by the kernel.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buf)?)
    }

    /// The bound address (with the kernel-chosen port when bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// A second handle on the same socket, e.g. one thread sending while
    /// another receives.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self {
            socket: self.socket.try_clone()?,
            local_addr: self.local_addr,
        })
    }
}

impl std::fmt::Debug for UdpEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpEndpoint")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_reaches_peer() {
        let receiver = UdpEndpoint::bind("127.0.0.1:0").unwrap();
        let sender = UdpEndpoint::bind("127.0.0.1:0").unwrap();

        sender.send_to(b"hello", receiver.local_addr()).unwrap();

        let mut buf = [0u8; 16];
        let (n, from) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, sender.local_addr());
    }

    #[test]
    fn test_bind_conflict_reports_address() {
        let first = UdpEndpoint::bind("127.0.0.1:0").unwrap();
        let taken = first.local_addr();

        match UdpEndpoint::bind(taken) {
            Err(TransportError::Bind { addr, .. }) => assert_eq!(addr, taken),
            other => panic!("expected bind error, got {other:?}"),
        }
    }
}
