use std::net::ToSocketAddrs;
use std::sync::{mpsc, Arc, Mutex};

use mio::Poll;
use tcpprims_transport::resolve;
use tracing::{debug, info};

use super::event_loop::{EventLoop, Role};
use super::{Command, LoopHandle};
use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use crate::handler::{Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::sync::lock;
use crate::transport::{Strategy, Transport};

/// Event-loop TCP client holding at most one connection.
///
/// The loop thread starts with the client; [`connect`](Self::connect) hands
/// the non-blocking connect to it and waits for the outcome.
#[derive(Clone)]
pub struct SelectorClient {
    handle: LoopHandle,
    connecting: Arc<Mutex<()>>,
}

impl SelectorClient {
    pub fn new(handler: impl Handler) -> Result<Self> {
        Self::with_config(handler, PeerConfig::default())
    }

    pub fn with_config(handler: impl Handler, config: PeerConfig) -> Result<Self> {
        Self::start(Arc::new(handler), config)
    }

    pub(crate) fn start(handler: Arc<dyn Handler>, config: PeerConfig) -> Result<Self> {
        let poll = Poll::new()?;
        let (handle, queue) = LoopHandle::new(&poll, config)?;
        let client = Self {
            handle,
            connecting: Arc::new(Mutex::new(())),
        };
        let event_loop = EventLoop::new(
            poll,
            queue,
            Role::Client,
            client.handle.clone(),
            handler,
            client.clone(),
        );
        client.handle.spawn("tcpprims-selector-client", event_loop)?;
        Ok(client)
    }

    /// Connect to `addr`, blocking until connected or failed.
    ///
    /// Returns the existing id while a connection is live. Fails with
    /// [`PeerError::EventThread`] when called from a hook, since the loop
    /// that would finish the connect is the one running the hook.
    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<ConnectionId> {
        if self.handle.on_loop_thread() {
            return Err(PeerError::EventThread("connect"));
        }
        if self.handle.is_stopped() {
            return Err(PeerError::Stopped);
        }
        let addrs = resolve(addr)?;

        let _serialized = lock(&self.connecting);
        let (reply, outcome) = mpsc::channel();
        self.handle.submit(Command::Connect { addrs, reply })?;
        let id = outcome.recv().map_err(|_| PeerError::Stopped)??;
        info!(%id, "selector client connected");
        Ok(id)
    }

    /// The live connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.handle.registry().ids().first().copied()
    }
}

impl Transport for SelectorClient {
    fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        self.handle.send(id, payload)
    }

    fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn) {
        self.handle.set_receiver(id, receiver);
    }

    fn close(&self, id: ConnectionId) {
        self.handle.close(id);
    }

    fn stop(&self) {
        if !self.handle.is_stopped() {
            debug!("stopping selector client");
        }
        self.handle.stop();
    }

    fn connection_count(&self) -> usize {
        self.handle.connection_count()
    }

    fn strategy(&self) -> Strategy {
        Strategy::Selector
    }
}

impl std::fmt::Debug for SelectorClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorClient")
            .field("connection", &self.connection_id())
            .field("stopped", &self.handle.is_stopped())
            .finish()
    }
}
