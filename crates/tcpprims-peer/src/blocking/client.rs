use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tcpprims_transport::TcpConnection;
use tracing::{debug, info, warn};

use super::connection::Connections;
use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use crate::handler::{self, Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::sync::lock;
use crate::transport::{Strategy, Transport};

/// Thread-per-connection TCP client holding at most one connection.
#[derive(Clone)]
pub struct BlockingClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connections: Arc<Connections>,
    handler: Arc<dyn Handler>,
    // Serializes connect so concurrent callers share one socket.
    current: Mutex<Option<ConnectionId>>,
    stopped: AtomicBool,
}

impl BlockingClient {
    pub fn new(handler: impl Handler) -> Self {
        Self::with_config(handler, PeerConfig::default())
    }

    pub fn with_config(handler: impl Handler, config: PeerConfig) -> Self {
        Self::start(Arc::new(handler), config)
    }

    pub(crate) fn start(handler: Arc<dyn Handler>, config: PeerConfig) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                connections: Arc::new(Connections::new(config)),
                handler,
                current: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Connect to `addr` (blocking) and start the reader thread.
    ///
    /// Returns the existing id while a connection is live. The connect hook
    /// runs on this thread before the reader starts.
    pub fn connect(&self, addr: impl ToSocketAddrs) -> Result<ConnectionId> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(PeerError::Stopped);
        }

        let connections = &self.inner.connections;
        let mut current = lock(&self.inner.current);
        if let Some(id) = *current {
            if connections.contains(id) {
                return Ok(id);
            }
        }

        let stream = TcpConnection::connect(addr)?;
        let peer = stream.peer_addr().ok();
        let (id, reader) = connections.register(stream)?;
        // A stop that raced the connect has already drained the table.
        if self.inner.stopped.load(Ordering::SeqCst) {
            connections.close(id);
            return Err(PeerError::Stopped);
        }
        *current = Some(id);
        drop(current);
        info!(%id, peer = ?peer, "blocking client connected");

        let handler = &self.inner.handler;
        handler::guarded("on_connect", id, || handler.on_connect(self, id));

        if let Err(err) = connections.start_reader(id, reader, self.clone(), Arc::clone(handler)) {
            warn!(%id, error = %err, "failed to start reader thread");
            connections.close(id);
            return Err(err);
        }
        Ok(id)
    }

    /// The live connection, if any.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        let current = *lock(&self.inner.current);
        current.filter(|id| self.inner.connections.contains(*id))
    }
}

impl Transport for BlockingClient {
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
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("stopping blocking client");
        // Any connect past its stop check registers before it re-checks, so
        // the drain below or that re-check catches it.
        self.inner.connections.close_all();
    }

    fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    fn strategy(&self) -> Strategy {
        Strategy::Blocking
    }
}

impl std::fmt::Debug for BlockingClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingClient")
            .field("connection", &self.connection_id())
            .field("stopped", &self.inner.stopped.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use bytes::Bytes;
    use tcpprims_frame::{FrameReader, FrameWriter};
    use tcpprims_transport::TcpSocketListener;

    use super::*;

    fn ignore() -> impl Handler {
        |_: &dyn Transport, _: ConnectionId, _: Bytes| {}
    }

    #[test]
    fn second_connect_reuses_live_connection() {
        let listener = TcpSocketListener::bind("127.0.0.1:0").expect("listener should bind");
        let client = BlockingClient::new(ignore());

        let first = client
            .connect(listener.local_addr())
            .expect("connect should succeed");
        let _peer = listener.accept().expect("accept should succeed");
        let second = client
            .connect(listener.local_addr())
            .expect("second connect should succeed");

        assert_eq!(first, second);
        assert_eq!(client.connection_count(), 1);
        client.stop();
    }

    #[test]
    fn receives_payloads_from_server() {
        let listener = TcpSocketListener::bind("127.0.0.1:0").expect("listener should bind");
        let (tx, rx) = mpsc::channel();
        let client = BlockingClient::new(move |_: &dyn Transport, _: ConnectionId, payload: Bytes| {
            let _ = tx.send(payload);
        });

        let id = client
            .connect(listener.local_addr())
            .expect("connect should succeed");
        let peer = listener.accept().expect("accept should succeed");
        let mut reader = FrameReader::new(peer.try_clone().expect("clone should succeed"));
        FrameWriter::new(peer).send(b"pong").expect("send should succeed");

        let got = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("payload should arrive");
        assert_eq!(&got[..], b"pong");

        client.send(id, b"ping").expect("send should succeed");
        assert_eq!(&reader.read_frame().expect("frame should arrive")[..], b"ping");
        client.stop();
    }

    #[test]
    fn peer_disconnect_clears_connection() {
        let listener = TcpSocketListener::bind("127.0.0.1:0").expect("listener should bind");
        let (tx, rx) = mpsc::channel();

        struct Closed(Mutex<mpsc::Sender<ConnectionId>>);
        impl Handler for Closed {
            fn on_receive(&self, _: &dyn Transport, _: ConnectionId, _: Bytes) {}
            fn on_close(&self, _: &dyn Transport, id: ConnectionId) {
                let _ = lock(&self.0).send(id);
            }
        }

        let client = BlockingClient::new(Closed(Mutex::new(tx)));
        let id = client
            .connect(listener.local_addr())
            .expect("connect should succeed");
        listener.accept().expect("accept should succeed").close();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(id));
        assert_eq!(client.connection_id(), None);
        client.stop();
    }

    #[test]
    fn connect_after_stop_fails() {
        let client = BlockingClient::new(ignore());
        client.stop();
        assert!(matches!(
            client.connect("127.0.0.1:1"),
            Err(PeerError::Stopped)
        ));
    }

    #[test]
    fn stop_racing_connect_leaves_nothing_behind() {
        let listener = TcpSocketListener::bind("127.0.0.1:0").expect("listener should bind");
        let addr = listener.local_addr();
        let _acceptor = std::thread::spawn(move || {
            // Keep accepting so connects never stall; detached on return.
            while let Ok(stream) = listener.accept() {
                drop(stream);
            }
        });

        for _ in 0..50 {
            let client = BlockingClient::new(ignore());
            let racer = {
                let client = client.clone();
                std::thread::spawn(move || client.connect(addr))
            };
            client.stop();

            match racer.join().expect("connect should not panic") {
                Ok(_) | Err(PeerError::Stopped) => {}
                Err(err) => panic!("unexpected connect error: {err}"),
            }
            assert_eq!(client.connection_count(), 0);
            assert_eq!(client.connection_id(), None);
        }
    }

    #[test]
    fn refused_connect_is_a_transport_error() {
        let addr = {
            let listener = TcpSocketListener::bind("127.0.0.1:0").expect("listener should bind");
            listener.local_addr()
        };
        let client = BlockingClient::new(ignore());
        assert!(matches!(client.connect(addr), Err(PeerError::Transport(_))));
    }
}
