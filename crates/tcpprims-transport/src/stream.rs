use std::io::{Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};

use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::listener::resolve;

/// A connected TCP stream: implements Read + Write.
///
/// This is the fundamental I/O type returned by transport operations.
pub struct TcpConnection {
    inner: TcpStream,
}

impl Read for TcpConnection {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for TcpConnection {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl TcpConnection {
    /// Connect to the first resolved address that accepts (blocking).
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        let mut last_err = None;
        for candidate in resolve(addr)? {
            match TcpStream::connect(candidate) {
                Ok(stream) => {
                    debug!(addr = %candidate, "connected to tcp socket");
                    return Ok(Self::from_std(stream));
                }
                Err(source) => {
                    last_err = Some(TransportError::Connect {
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

    /// Wrap an already connected std stream.
    pub fn from_std(stream: TcpStream) -> Self {
        Self { inner: stream }
    }

    /// Enable or disable Nagle's algorithm.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.inner.set_nodelay(nodelay).map_err(Into::into)
    }

    /// Address of the remote peer.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner.peer_addr().map_err(Into::into)
    }

    /// Local address of this end of the connection.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.inner.local_addr().map_err(Into::into)
    }

    /// Try to clone this stream (creates a new file descriptor for the same
    /// socket).
    pub fn try_clone(&self) -> Result<Self> {
        let cloned = self.inner.try_clone()?;
        Ok(Self::from_std(cloned))
    }

    /// Shut down both directions, each step attempted independently.
    ///
    /// Errors are swallowed: a peer that already went away makes either step
    /// fail with `NotConnected`, which is the expected outcome here. Every
    /// clone of this stream observes the shutdown, so a thread blocked in
    /// `read` on a clone wakes up with end-of-stream.
    pub fn shutdown_quietly(&self) {
        if let Err(err) = self.inner.shutdown(Shutdown::Read) {
            trace!(error = %err, "shutdown(read) failed");
        }
        if let Err(err) = self.inner.shutdown(Shutdown::Write) {
            trace!(error = %err, "shutdown(write) failed");
        }
    }

    /// Best-effort close: shut down both directions, then release the
    /// descriptor.
    pub fn close(self) {
        self.shutdown_quietly();
        drop(self.inner);
    }
}

impl std::fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpConnection")
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
