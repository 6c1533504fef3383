use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::stream::TcpConnection;

/// Resolve `addr` into one or more socket addresses.
///
/// An address that resolves to nothing is reported as a resolution error
/// rather than an empty list.
pub fn resolve(addr: impl ToSocketAddrs) -> Result<Vec<SocketAddr>> {
    let addrs: Vec<SocketAddr> = addr
        .to_socket_addrs()
        .map_err(TransportError::Resolve)?
        .collect();
    if addrs.is_empty() {
        return Err(TransportError::Resolve(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "address resolved to no socket addresses",
        )));
    }
    Ok(addrs)
}

/// Listening TCP socket.
///
/// Provides bind/accept over `std::net::TcpListener`. A thread blocked in
/// [`accept`](TcpSocketListener::accept) is released from another thread
/// with [`wake_addr`] on the bound address.
pub struct TcpSocketListener {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocketListener {
    /// Bind and listen on the first resolved address that accepts the bind.
    pub fn bind(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut last_err = None;
        for candidate in resolve(addr)? {
            match TcpListener::bind(candidate) {
                Ok(listener) => {
                    let local_addr = listener.local_addr().map_err(|e| TransportError::Bind {
                        addr: candidate,
                        source: e,
                    })?;
                    info!(%local_addr, "listening on tcp socket");
                    return Ok(Self {
                        listener,
                        local_addr,
                    });
                }
                Err(source) => {
                    debug!(addr = %candidate, error = %source, "bind attempt failed");
                    last_err = Some(TransportError::Bind {
                        addr: candidate,
                        source,
                    });
                }
            }
        }
        // resolve() never yields an empty list, so at least one attempt ran.
        Err(last_err.unwrap_or_else(|| {
            TransportError::Resolve(std::io::Error::from(std::io::ErrorKind::InvalidInput))
        }))
    }

    /// Accept an incoming connection (blocking).
    pub fn accept(&self) -> Result<TcpConnection> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(%peer, "accepted connection");
        Ok(TcpConnection::from_std(stream))
    }

    /// The address this socket is bound to (with the kernel-chosen port when
    /// bound to port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Consume the wrapper and return the std listener.
    pub fn into_std(self) -> TcpListener {
        self.listener
    }
}

/// Connect to `addr` once and drop the stream, releasing a blocked acceptor.
///
/// The accepting side checks its own stop flag after every accept and
/// discards the wake-up connection.
///
/// Unspecified listen addresses (`0.0.0.0`, `::`) are reached over loopback.
pub fn wake_addr(addr: SocketAddr) -> Result<()> {
    let target = if addr.ip().is_unspecified() {
        let loopback = match addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, addr.port())
    } else {
        addr
    };
    let stream = std::net::TcpStream::connect(target).map_err(|e| TransportError::Connect {
        addr: target,
        source: e,
    })?;
    drop(stream);
    Ok(())
}

impl std::fmt::Debug for TcpSocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpSocketListener")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
