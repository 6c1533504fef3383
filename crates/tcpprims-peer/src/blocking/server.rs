use std::io::ErrorKind;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use tcpprims_transport::{wake_addr, TcpConnection, TcpSocketListener, TransportError};
use tracing::{debug, error, info, warn};

use super::connection::Connections;
use crate::config::PeerConfig;
use crate::error::Result;
use crate::handler::{self, Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::sync::lock;
use crate::transport::{Strategy, Transport};

/// Thread-per-connection TCP server.
///
/// Cheap to clone; every clone drives the same listener. Dropping handles
/// does not stop the server, call [`Transport::stop`].
#[derive(Clone)]
pub struct BlockingServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    local_addr: SocketAddr,
    connections: Arc<Connections>,
    handler: Arc<dyn Handler>,
    stopping: AtomicBool,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingServer {
    /// Bind `addr` and start the acceptor thread.
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
        let listener = TcpSocketListener::bind(addr)?;
        let server = Self {
            inner: Arc::new(ServerInner {
                local_addr: listener.local_addr(),
                connections: Arc::new(Connections::new(config)),
                handler,
                stopping: AtomicBool::new(false),
                acceptor: Mutex::new(None),
            }),
        };

        let acceptor = server.clone();
        let handle = thread::Builder::new()
            .name("tcpprims-acceptor".to_string())
            .spawn(move || acceptor.accept_loop(listener))?;
        *lock(&server.inner.acceptor) = Some(handle);

        info!(addr = %server.local_addr(), "blocking server listening");
        Ok(server)
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Live connection ids in ascending order.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.connections.ids()
    }

    /// Whether [`stop`](Transport::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    fn accept_loop(self, listener: TcpSocketListener) {
        loop {
            let stream = match listener.accept() {
                Ok(stream) => stream,
                Err(TransportError::Accept(err)) if is_transient(err.kind()) => {
                    debug!(error = %err, "transient accept failure");
                    continue;
                }
                Err(err) => {
                    if !self.is_stopped() {
                        error!(error = %err, "accept failed; acceptor exiting");
                    }
                    break;
                }
            };

            if self.is_stopped() {
                stream.close();
                break;
            }
            self.admit(stream);
        }
        debug!(addr = %self.local_addr(), "acceptor stopped");
    }

    fn admit(&self, stream: TcpConnection) {
        let connections = &self.inner.connections;
        let (id, reader) = match connections.register(stream) {
            Ok(registered) => registered,
            Err(err) => {
                warn!(error = %err, "failed to register accepted connection");
                return;
            }
        };

        let handler = &self.inner.handler;
        handler::guarded("on_accept", id, || handler.on_accept(self, id));

        if let Err(err) = connections.start_reader(id, reader, self.clone(), Arc::clone(handler)) {
            warn!(%id, error = %err, "failed to start reader thread");
            connections.close(id);
        }
    }
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
    )
}

impl Transport for BlockingServer {
    fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        self.inner.connections.send(id, payload)
    }

    fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn) {
        self.inner.connections.set_receiver(id, receiver);
    }

    fn close(&self, id: ConnectionId) {
        self.inner.connections.close(id);
    }

    fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(addr = %self.local_addr(), "stopping blocking server");

        // The acceptor may already be gone, in which case nobody is listening.
        if let Err(err) = wake_addr(self.local_addr()) {
            debug!(error = %err, "acceptor wake-up connect failed");
        }
        let acceptor = lock(&self.inner.acceptor).take();
        if let Some(handle) = acceptor {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                warn!("acceptor thread panicked");
            }
        }

        self.inner.connections.close_all();
    }

    fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn strategy(&self) -> Strategy {
        Strategy::Blocking
    }
}

impl std::fmt::Debug for BlockingServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingServer")
            .field("local_addr", &self.inner.local_addr)
            .field("connections", &self.inner.connections.len())
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

    use super::*;

    fn echo_server() -> BlockingServer {
        BlockingServer::listen(
            "127.0.0.1:0",
            |link: &dyn Transport, id: ConnectionId, payload: Bytes| {
                let _ = link.send(id, &payload);
            },
        )
        .expect("server should bind")
    }

    #[test]
    fn echoes_over_raw_frames() {
        let server = echo_server();
        let stream = TcpConnection::connect(server.local_addr()).expect("client should connect");
        let mut writer = FrameWriter::new(stream.try_clone().expect("clone should succeed"));
        let mut reader = FrameReader::new(stream);

        writer.send(b"hello").expect("send should succeed");
        assert_eq!(&reader.read_frame().expect("echo should arrive")[..], b"hello");

        server.stop();
    }

    #[test]
    fn accept_hook_runs_before_first_payload() {
        struct Ordered(mpsc::Sender<&'static str>);

        impl Handler for Ordered {
            fn on_accept(&self, _link: &dyn Transport, _id: ConnectionId) {
                let _ = self.0.send("accept");
            }
            fn on_receive(&self, _link: &dyn Transport, _id: ConnectionId, _payload: Bytes) {
                let _ = self.0.send("receive");
            }
            fn on_close(&self, _link: &dyn Transport, _id: ConnectionId) {
                let _ = self.0.send("close");
            }
        }

        let (tx, rx) = mpsc::channel();
        let server = BlockingServer::listen("127.0.0.1:0", Ordered(tx)).expect("server should bind");
        let stream = TcpConnection::connect(server.local_addr()).expect("client should connect");
        FrameWriter::new(stream.try_clone().expect("clone should succeed"))
            .send(b"x")
            .expect("send should succeed");

        let wait = Duration::from_secs(5);
        assert_eq!(rx.recv_timeout(wait), Ok("accept"));
        assert_eq!(rx.recv_timeout(wait), Ok("receive"));
        stream.close();
        assert_eq!(rx.recv_timeout(wait), Ok("close"));

        server.stop();
    }

    #[test]
    fn stop_is_idempotent_and_releases_the_port() {
        let server = echo_server();
        let addr = server.local_addr();
        let _client = TcpConnection::connect(addr).expect("client should connect");

        server.stop();
        server.stop();
        assert!(server.is_stopped());
        assert_eq!(server.connection_count(), 0);

        let rebound = BlockingServer::listen(addr, |_: &dyn Transport, _: ConnectionId, _: Bytes| {})
            .expect("port should be free after stop");
        rebound.stop();
    }

    #[test]
    fn oversized_send_is_rejected_without_closing() {
        let config = PeerConfig {
            max_payload_size: 8,
            ..PeerConfig::default()
        };
        let (tx, rx) = mpsc::channel();
        let server = BlockingServer::listen_with_config(
            "127.0.0.1:0",
            move |link: &dyn Transport, id: ConnectionId, _payload: Bytes| {
                let _ = tx.send(link.send(id, &[0u8; 9]).is_err());
                let _ = link.send(id, b"ok");
            },
            config,
        )
        .expect("server should bind");

        let stream = TcpConnection::connect(server.local_addr()).expect("client should connect");
        let mut reader = FrameReader::new(stream.try_clone().expect("clone should succeed"));
        FrameWriter::new(stream).send(b"go").expect("send should succeed");

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(true));
        assert_eq!(&reader.read_frame().expect("reply should arrive")[..], b"ok");
        assert_eq!(server.connection_count(), 1);

        server.stop();
    }
}
