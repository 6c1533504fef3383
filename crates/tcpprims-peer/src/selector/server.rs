use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;

use mio::{Interest, Poll};
use tcpprims_transport::TcpSocketListener;
use tracing::info;

use super::event_loop::{EventLoop, Role};
use super::{LoopHandle, SOCKET};
use crate::config::PeerConfig;
use crate::error::Result;
use crate::handler::{Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::transport::{Strategy, Transport};

/// Event-loop TCP server: one thread multiplexes the listener and every
/// accepted connection.
///
/// Cheap to clone. `send`, `close` and `set_receiver` are queued for the
/// loop thread, so a send error surfaces as an eviction and `on_close`, not
/// as a return value.
#[derive(Clone)]
pub struct SelectorServer {
    handle: LoopHandle,
    local_addr: SocketAddr,
}

impl SelectorServer {
    /// Bind `addr` and start the event loop.
    pub fn listen(addr: impl ToSocketAddrs, handler: impl Handler) -> Result<Self> {
        Self::listen_with_config(addr, handler, PeerConfig::default())
    }

    pub fn listen_with_config(
        addr: impl ToSocketAddrs,
        handler: impl Handler,
        config: PeerConfig,
    ) -> Result<Self> {
        Self::start(addr, Arc::new(handler), config)
    }

    pub(crate) fn start(
        addr: impl ToSocketAddrs,
        handler: Arc<dyn Handler>,
        config: PeerConfig,
    ) -> Result<Self> {
        let bound = TcpSocketListener::bind(addr)?;
        let local_addr = bound.local_addr();
        let std_listener = bound.into_std();
        std_listener.set_nonblocking(true)?;
        let mut listener = mio::net::TcpListener::from_std(std_listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, SOCKET, Interest::READABLE)?;
        let (handle, queue) = LoopHandle::new(&poll, config)?;

        let server = Self { handle, local_addr };
        let event_loop = EventLoop::new(
            poll,
            queue,
            Role::Server(listener),
            server.handle.clone(),
            handler,
            server.clone(),
        );
        server.handle.spawn("tcpprims-selector", event_loop)?;

        info!(addr = %local_addr, "selector server listening");
        Ok(server)
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Live connection ids in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.handle.registry().ids()
    }

    pub fn is_stopped(&self) -> bool {
        self.handle.is_stopped()
    }
}

impl Transport for SelectorServer {
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
            info!(addr = %self.local_addr, "stopping selector server");
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

impl std::fmt::Debug for SelectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorServer")
            .field("local_addr", &self.local_addr)
            .field("connections", &self.connection_count())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::Bytes;
    use tcpprims_frame::{FrameReader, FrameWriter};
    use tcpprims_transport::TcpConnection;

    use super::*;

    #[test]
    fn echoes_over_raw_frames() {
        let server = SelectorServer::listen(
            "127.0.0.1:0",
            |link: &dyn Transport, id: ConnectionId, payload: Bytes| {
                let _ = link.send(id, &payload);
            },
        )
        .expect("server should bind");

        let stream = TcpConnection::connect(server.local_addr()).expect("client should connect");
        let mut writer = FrameWriter::new(stream.try_clone().expect("clone should succeed"));
        let mut reader = FrameReader::new(stream);

        for payload in [&b"one"[..], b"", b"three"] {
            writer.send(payload).expect("send should succeed");
            assert_eq!(&reader.read_frame().expect("echo should arrive")[..], payload);
        }

        server.stop();
        assert!(server.is_stopped());
    }

    #[test]
    fn stop_from_a_hook_does_not_deadlock() {
        let (tx, rx) = mpsc::channel();
        let server = SelectorServer::listen(
            "127.0.0.1:0",
            move |link: &dyn Transport, _id: ConnectionId, _payload: Bytes| {
                link.stop();
                let _ = tx.send(());
            },
        )
        .expect("server should bind");

        let stream = TcpConnection::connect(server.local_addr()).expect("client should connect");
        let mut reader = FrameReader::new(stream.try_clone().expect("clone should succeed"));
        FrameWriter::new(stream).send(b"stop").expect("send should succeed");

        rx.recv_timeout(Duration::from_secs(5))
            .expect("hook should run");
        assert!(reader.read_frame().is_err(), "stop should close the connection");
        server.stop();
    }

    #[test]
    fn send_after_stop_is_a_no_op() {
        let server =
            SelectorServer::listen("127.0.0.1:0", |_: &dyn Transport, _: ConnectionId, _: Bytes| {})
                .expect("server should bind");
        server.stop();
        assert!(server.send(ConnectionId::new(1), b"late").is_ok());
        server.close(ConnectionId::new(1));
    }
}
