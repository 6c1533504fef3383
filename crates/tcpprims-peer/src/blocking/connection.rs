use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use tcpprims_frame::{FrameError, FrameReader, FrameWriter};
use tcpprims_transport::TcpConnection;
use tracing::{debug, trace, warn};

use crate::config::PeerConfig;
use crate::error::Result;
use crate::handler::{self, Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::registry::Registry;
use crate::sync::{lock, read, write};
use crate::transport::Transport;

thread_local! {
    static IN_DISPATCH: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as running a receive callback.
struct DispatchScope {
    outer: bool,
}

impl DispatchScope {
    fn enter() -> Self {
        Self {
            outer: IN_DISPATCH.with(|flag| flag.replace(true)),
        }
    }

    fn active() -> bool {
        IN_DISPATCH.with(Cell::get)
    }
}

impl Drop for DispatchScope {
    fn drop(&mut self) {
        IN_DISPATCH.with(|flag| flag.set(self.outer));
    }
}

/// One registered socket.
pub(super) struct BlockingConnection {
    control: TcpConnection,
    writer: Mutex<FrameWriter<TcpConnection>>,
    receiver: Mutex<Option<ReceiveFn>>,
    closed: AtomicBool,
    // Held shared while a payload is being dispatched.
    gate: RwLock<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl BlockingConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark closed and shut the socket down, waking the reader thread and any
    /// blocked writer.
    fn shut(&self) {
        self.closed.store(true, Ordering::Release);
        self.control.shutdown_quietly();
    }

    /// Wait out a dispatch in progress on the reader thread.
    ///
    /// Skipped when the caller is itself a receive callback: it may be that
    /// very dispatch, and a callback on another connection waiting here could
    /// deadlock against a callback waiting on it.
    fn settle(&self) {
        if !DispatchScope::active() {
            drop(write(&self.gate));
        }
    }

    fn dispatch(
        &self,
        link: &dyn Transport,
        handler: &dyn Handler,
        id: ConnectionId,
        payload: Bytes,
    ) {
        let _gate = read(&self.gate);
        if self.is_closed() {
            trace!(%id, "dropping payload for closed connection");
            return;
        }
        let receiver = lock(&self.receiver).clone();
        let _scope = DispatchScope::enter();
        handler::deliver(link, handler, receiver.as_ref(), id, payload);
    }
}

/// The connection table shared by a blocking server or client and its
/// reader threads.
pub(super) struct Connections {
    registry: Registry<Arc<BlockingConnection>>,
    config: PeerConfig,
}

impl Connections {
    pub(super) fn new(config: PeerConfig) -> Self {
        Self {
            registry: Registry::new(),
            config,
        }
    }

    /// Register `stream` and hand back the reader half for
    /// [`start_reader`](Self::start_reader).
    pub(super) fn register(
        &self,
        stream: TcpConnection,
    ) -> Result<(ConnectionId, FrameReader<TcpConnection>)> {
        stream.set_nodelay(self.config.nodelay)?;
        let frame_config = self.config.frame_config();
        let reader = FrameReader::with_config(stream.try_clone()?, frame_config.clone());
        let writer = FrameWriter::with_config(stream.try_clone()?, frame_config);

        let id = self.registry.add(Arc::new(BlockingConnection {
            control: stream,
            writer: Mutex::new(writer),
            receiver: Mutex::new(None),
            closed: AtomicBool::new(false),
            gate: RwLock::new(()),
            reader: Mutex::new(None),
        }));
        Ok((id, reader))
    }

    /// Spawn the reader thread for `id`.
    ///
    /// The thread dispatches payloads until end-of-stream or a fault, then
    /// removes the connection (if still registered) and fires `on_close`.
    /// A connection already closed by its accept or connect hook gets its
    /// `on_close` here instead.
    pub(super) fn start_reader<L>(
        self: &Arc<Self>,
        id: ConnectionId,
        mut reader: FrameReader<TcpConnection>,
        link: L,
        handler: Arc<dyn Handler>,
    ) -> Result<()>
    where
        L: Transport + 'static,
    {
        let Some(conn) = self.registry.lookup(id) else {
            debug!(%id, "connection closed before its reader started");
            handler::guarded("on_close", id, || handler.on_close(&link, id));
            return Ok(());
        };

        let connections = Arc::clone(self);
        let entry = Arc::clone(&conn);
        let handle = thread::Builder::new()
            .name(format!("tcpprims-reader-{id}"))
            .spawn(move || {
                let result = reader
                    .for_each_frame(|payload| entry.dispatch(&link, &*handler, id, payload));
                match result {
                    Ok(()) => debug!(%id, "peer closed connection"),
                    Err(_) if entry.is_closed() => trace!(%id, "reader released by close"),
                    Err(err @ FrameError::PayloadTooLarge { .. }) => {
                        warn!(%id, error = %err, "peer sent oversized frame; closing")
                    }
                    Err(err) => debug!(%id, error = %err, "connection read failed"),
                }
                connections.close(id);
                handler::guarded("on_close", id, || handler.on_close(&link, id));
            })?;
        *lock(&conn.reader) = Some(handle);
        Ok(())
    }

    pub(super) fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let max = self.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            }
            .into());
        }

        let Some(conn) = self.registry.lookup(id) else {
            trace!(%id, "send to unknown connection ignored");
            return Ok(());
        };
        if conn.is_closed() {
            return Ok(());
        }

        let result = lock(&conn.writer).send(payload);
        match result {
            Ok(()) => Ok(()),
            // Lost a race with close; the payload was never promised.
            Err(_) if conn.is_closed() => Ok(()),
            Err(err) => {
                debug!(%id, error = %err, "send failed; closing connection");
                self.close(id);
                Err(err.into())
            }
        }
    }

    pub(super) fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn) {
        if let Some(conn) = self.registry.lookup(id) {
            *lock(&conn.receiver) = Some(receiver);
        }
    }

    /// Remove and shut down `id`. Returns whether it was live.
    ///
    /// Outside a receive callback this also waits for any dispatch already
    /// running on the connection, so nothing is delivered after it returns.
    pub(super) fn close(&self, id: ConnectionId) -> bool {
        let Some(conn) = self.registry.remove(id) else {
            return false;
        };
        conn.shut();
        conn.settle();
        debug!(%id, "connection closed");
        true
    }

    /// Close every connection and join their reader threads.
    pub(super) fn close_all(&self) {
        let drained = self.registry.drain();
        for (_, conn) in &drained {
            conn.shut();
        }

        let current = thread::current().id();
        for (id, conn) in drained {
            conn.settle();
            let handle = lock(&conn.reader).take();
            if let Some(handle) = handle {
                if handle.thread().id() != current && handle.join().is_err() {
                    warn!(%id, "reader thread panicked");
                }
            }
        }
    }

    pub(super) fn contains(&self, id: ConnectionId) -> bool {
        self.registry.contains(id)
    }

    pub(super) fn ids(&self) -> Vec<ConnectionId> {
        self.registry.ids()
    }

    pub(super) fn len(&self) -> usize {
        self.registry.len()
    }
}
