use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;

use crate::blocking::{BlockingClient, BlockingServer};
use crate::config::PeerConfig;
use crate::error::Result;
use crate::handler::{Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::selector::{SelectorClient, SelectorServer};

/// How a transport drives its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Thread per connection, blocking reads, writes on the caller's thread.
    Blocking,
    /// One event-loop thread over non-blocking sockets.
    Selector,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Blocking => "blocking",
            Strategy::Selector => "selector",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "blocking" => Ok(Strategy::Blocking),
            "selector" => Ok(Strategy::Selector),
            other => Err(format!(
                "unknown strategy '{other}' (expected 'blocking' or 'selector')"
            )),
        }
    }
}

/// Operations every server and client supports, whatever its strategy.
///
/// All methods take `&self` and may be called from any thread, including
/// from inside a [`Handler`] hook.
pub trait Transport: Send + Sync {
    /// Send one payload to connection `id`.
    ///
    /// Payloads above the configured maximum fail with
    /// [`FrameError::PayloadTooLarge`](tcpprims_frame::FrameError) and nothing
    /// is written. Sending to an unknown or closed id is a silent no-op. An
    /// I/O fault closes the connection; the blocking strategy also returns
    /// the error.
    fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()>;

    /// Route every later payload of `id` to `receiver` instead of
    /// [`Handler::on_receive`]. Unknown ids are ignored.
    fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn);

    /// Close connection `id`. Idempotent; unknown ids are ignored.
    fn close(&self, id: ConnectionId);

    /// Stop accepting, close every connection and release the transport's
    /// threads. Idempotent.
    fn stop(&self);

    /// Number of live connections.
    fn connection_count(&self) -> usize;

    fn strategy(&self) -> Strategy;
}

/// A listening server of either strategy.
#[derive(Clone)]
pub enum Server {
    Blocking(BlockingServer),
    Selector(SelectorServer),
}

impl Server {
    /// Bind `addr` and start accepting with default configuration.
    pub fn listen(
        strategy: Strategy,
        addr: impl ToSocketAddrs,
        handler: impl Handler,
    ) -> Result<Self> {
        Self::listen_with_config(strategy, addr, handler, PeerConfig::default())
    }

    /// Bind `addr` and start accepting with explicit configuration.
    pub fn listen_with_config(
        strategy: Strategy,
        addr: impl ToSocketAddrs,
        handler: impl Handler,
        config: PeerConfig,
    ) -> Result<Self> {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        Ok(match strategy {
            Strategy::Blocking => Server::Blocking(BlockingServer::start(addr, handler, config)?),
            Strategy::Selector => Server::Selector(SelectorServer::start(addr, handler, config)?),
        })
    }

    /// The bound address, with the kernel-chosen port when bound to port 0.
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Server::Blocking(server) => server.local_addr(),
            Server::Selector(server) => server.local_addr(),
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            Server::Blocking(server) => server,
            Server::Selector(server) => server,
        }
    }
}

/// A client of either strategy holding at most one connection.
#[derive(Clone)]
pub enum Client {
    Blocking(BlockingClient),
    Selector(SelectorClient),
}

impl Client {
    /// Create an unconnected client with default configuration.
    pub fn new(strategy: Strategy, handler: impl Handler) -> Result<Self> {
        Self::with_config(strategy, handler, PeerConfig::default())
    }

    /// Create an unconnected client with explicit configuration.
    ///
    /// The selector strategy starts its event-loop thread here.
    pub fn with_config(
        strategy: Strategy,
        handler: impl Handler,
        config: PeerConfig,
    ) -> Result<Self> {
        let handler: Arc<dyn Handler> = Arc::new(handler);
        Ok(match strategy {
            Strategy::Blocking => Client::Blocking(BlockingClient::start(handler, config)),
            Strategy::Selector => Client::Selector(SelectorClient::start(handler, config)?),
        })
    }

    /// Connect to `addr`, blocking until connected or failed.
    ///
    /// While a connection is live, returns its id without reconnecting.
    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<ConnectionId> {
        match self {
            Client::Blocking(client) => client.connect(addr),
            Client::Selector(client) => client.connect(addr),
        }
    }

    /// The live connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        match self {
            Client::Blocking(client) => client.connection_id(),
            Client::Selector(client) => client.connection_id(),
        }
    }

    fn inner(&self) -> &dyn Transport {
        match self {
            Client::Blocking(client) => client,
            Client::Selector(client) => client,
        }
    }
}

macro_rules! delegate_transport {
    ($ty:ty) => {
        impl Transport for $ty {
            fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
                self.inner().send(id, payload)
            }

            fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn) {
                self.inner().set_receiver(id, receiver)
            }

            fn close(&self, id: ConnectionId) {
                self.inner().close(id)
            }

            fn stop(&self) {
                self.inner().stop()
            }

            fn connection_count(&self) -> usize {
                self.inner().connection_count()
            }

            fn strategy(&self) -> Strategy {
                self.inner().strategy()
            }
        }
    };
}

delegate_transport!(Server);
delegate_transport!(Client);
