use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use bytes::Bytes;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll};
use tcpprims_transport::TransportError;
use tracing::{debug, error, trace, warn};

use super::channel::{Channel, ReadOutcome};
use super::{Command, LoopHandle, SOCKET, WAKER};
use crate::error::{PeerError, Result};
use crate::handler::{self, Handler, ReceiveFn};
use crate::id::ConnectionId;
use crate::registry::Registry;
use crate::transport::Transport;

/// What the loop's token-zero socket is.
pub(super) enum Role {
    Server(TcpListener),
    Client,
}

/// A client connect waiting for the socket to become writable.
struct PendingConnect {
    stream: TcpStream,
    addr: SocketAddr,
    remaining: VecDeque<SocketAddr>,
    reply: mpsc::Sender<Result<ConnectionId>>,
}

#[derive(Clone, Copy)]
enum Hook {
    Accept,
    Connect,
}

/// Owns the poller and every socket of one selector transport.
///
/// `L` is the public transport handed to hooks as `link`.
pub(super) struct EventLoop<L> {
    poll: Poll,
    events: Events,
    scratch: Vec<u8>,
    queue: mpsc::Receiver<Command>,
    role: Role,
    pending: Option<PendingConnect>,
    // Connections whose last read pass ran out of budget.
    backlog: VecDeque<ConnectionId>,
    handle: LoopHandle,
    handler: Arc<dyn Handler>,
    link: L,
}

impl<L: Transport> EventLoop<L> {
    pub(super) fn new(
        poll: Poll,
        queue: mpsc::Receiver<Command>,
        role: Role,
        handle: LoopHandle,
        handler: Arc<dyn Handler>,
        link: L,
    ) -> Self {
        let config = handle.config();
        Self {
            events: Events::with_capacity(config.event_capacity.max(1)),
            scratch: vec![0u8; config.read_buffer_size.max(1)],
            poll,
            queue,
            role,
            pending: None,
            backlog: VecDeque::new(),
            handle,
            handler,
            link,
        }
    }

    fn registry(&self) -> &Registry<Channel> {
        self.handle.registry()
    }

    pub(super) fn run(mut self) {
        self.handle.bind_loop_thread();
        debug!("event loop started");

        loop {
            if !self.run_commands() {
                break;
            }
            // Data is already waiting on backlogged sockets; only check for
            // new readiness instead of sleeping.
            let timeout = (!self.backlog.is_empty()).then_some(Duration::ZERO);
            if let Err(err) = self.poll.poll(&mut self.events, timeout) {
                if err.kind() == ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %err, "poll failed; stopping event loop");
                break;
            }

            let events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            for event in events.iter() {
                self.handle_event(event);
            }
            self.events = events;
            self.run_backlog();
        }

        self.shutdown();
    }

    /// Run every queued command. Returns false once shutdown was requested.
    fn run_commands(&mut self) -> bool {
        loop {
            match self.queue.try_recv() {
                Ok(Command::Send(id, payload)) => self.queue_send(id, &payload),
                Ok(Command::Close(id)) => self.evict(id, "closed locally"),
                Ok(Command::SetReceiver(id, receiver)) => {
                    self.registry()
                        .with_entry(id, |channel| channel.receiver = Some(receiver));
                }
                Ok(Command::Connect { addrs, reply }) => self.start_connect(addrs, reply),
                Ok(Command::Shutdown) | Err(mpsc::TryRecvError::Disconnected) => return false,
                Err(mpsc::TryRecvError::Empty) => return true,
            }
        }
    }

    /// Give every backlogged connection one more read pass.
    fn run_backlog(&mut self) {
        for id in std::mem::take(&mut self.backlog) {
            self.read_ready(id);
        }
    }

    fn handle_event(&mut self, event: &Event) {
        match event.token() {
            WAKER => {}
            SOCKET => match self.role {
                Role::Server(_) => self.accept_ready(),
                Role::Client => self.connect_ready(),
            },
            token => {
                let Some(id) = ConnectionId::from_token(token) else {
                    trace!(?token, "event for unknown token");
                    return;
                };
                if event.is_readable() || event.is_read_closed() || event.is_error() {
                    self.read_ready(id);
                }
                if event.is_writable() {
                    self.write_ready(id);
                }
            }
        }
    }

    fn accept_ready(&mut self) {
        let Role::Server(listener) = &self.role else {
            return;
        };

        // Edge-triggered: accept until the listen queue is empty.
        let mut accepted = Vec::new();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => accepted.push((stream, peer)),
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::Interrupted
                            | ErrorKind::ConnectionAborted
                            | ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    break;
                }
            }
        }

        for (stream, peer) in accepted {
            trace!(%peer, "accepted connection");
            // Failures are logged by admit; the stream is dropped.
            let _ = self.admit(stream, Hook::Accept);
        }
    }

    /// Register a connected stream and fire its hook.
    fn admit(&mut self, stream: TcpStream, hook: Hook) -> io::Result<ConnectionId> {
        let config = self.handle.config().clone();
        if let Err(err) = stream.set_nodelay(config.nodelay) {
            debug!(error = %err, "failed to set TCP_NODELAY");
        }

        let poll_registry = self.poll.registry();
        let result = self.handle.registry().try_add_with(|id| {
            let mut channel = Channel::new(stream, &config);
            channel.register(poll_registry, id.token())?;
            Ok::<_, io::Error>(channel)
        });
        let id = match result {
            Ok(id) => id,
            Err(err) => {
                warn!(error = %err, "failed to register connection");
                return Err(err);
            }
        };

        let peer = self.registry().with_entry(id, |channel| channel.peer).flatten();
        debug!(%id, peer = ?peer, "connection registered");

        let (handler, link) = (&self.handler, &self.link);
        match hook {
            Hook::Accept => handler::guarded("on_accept", id, || handler.on_accept(link, id)),
            Hook::Connect => handler::guarded("on_connect", id, || handler.on_connect(link, id)),
        }
        Ok(id)
    }

    fn read_ready(&mut self, id: ConnectionId) {
        let mut frames = Vec::new();
        let scratch = &mut self.scratch;
        let budget = self.handle.config().reads_per_pass;
        let Some((receiver, outcome)) = self.handle.registry().with_entry(id, |channel| {
            let outcome = channel.fill(scratch, budget, &mut frames);
            (channel.receiver.clone(), outcome)
        }) else {
            return;
        };

        // Hooks run outside the registry lock so they can call back in.
        for payload in frames {
            self.deliver(id, receiver.as_ref(), payload);
        }

        match outcome {
            ReadOutcome::Open => {}
            ReadOutcome::Pending => {
                if !self.backlog.contains(&id) {
                    self.backlog.push_back(id);
                }
            }
            ReadOutcome::Eof => self.evict(id, "peer closed connection"),
            ReadOutcome::Fault(err) => {
                if err.is_protocol_fault() {
                    warn!(%id, error = %err, "peer sent oversized frame; closing");
                } else {
                    debug!(%id, error = %err, "connection read failed");
                }
                self.evict(id, "read fault");
            }
        }
    }

    fn deliver(&self, id: ConnectionId, receiver: Option<&ReceiveFn>, payload: Bytes) {
        handler::deliver(&self.link, &*self.handler, receiver, id, payload);
    }

    fn write_ready(&mut self, id: ConnectionId) {
        let poll_registry = self.poll.registry();
        let result = self
            .handle
            .registry()
            .with_entry(id, |channel| channel.flush_and_rearm(poll_registry, id.token()));
        if let Some(Err(err)) = result {
            debug!(%id, error = %err, "write failed");
            self.evict(id, "write fault");
        }
    }

    fn queue_send(&mut self, id: ConnectionId, payload: &Bytes) {
        let poll_registry = self.poll.registry();
        let result = self.handle.registry().with_entry(id, |channel| {
            channel.enqueue(payload).map_err(io::Error::other)?;
            // Armed means a writable event is already due to flush.
            if channel.is_write_armed() {
                Ok(())
            } else {
                channel.flush_and_rearm(poll_registry, id.token())
            }
        });
        match result {
            None => trace!(%id, "send to closed connection dropped"),
            Some(Ok(())) => {}
            Some(Err(err)) => {
                debug!(%id, error = %err, "write failed");
                self.evict(id, "write fault");
            }
        }
    }

    /// Remove `id`, release its socket and fire `on_close`. Unknown ids are
    /// ignored, so every connection closes exactly once.
    fn evict(&mut self, id: ConnectionId, reason: &'static str) {
        let Some(channel) = self.registry().remove(id) else {
            return;
        };
        channel.release(self.poll.registry());
        debug!(%id, reason, "connection closed");
        let (handler, link) = (&self.handler, &self.link);
        handler::guarded("on_close", id, || handler.on_close(link, id));
    }

    fn start_connect(&mut self, addrs: Vec<SocketAddr>, reply: mpsc::Sender<Result<ConnectionId>>) {
        if let Some(id) = self.registry().ids().first().copied() {
            let _ = reply.send(Ok(id));
            return;
        }
        if self.pending.is_some() {
            let _ = reply.send(Err(PeerError::Io(io::Error::new(
                ErrorKind::WouldBlock,
                "connect already in progress",
            ))));
            return;
        }
        self.try_connect(addrs.into(), reply, None);
    }

    /// Start a non-blocking connect to the next candidate address, replying
    /// with the last failure once none are left.
    fn try_connect(
        &mut self,
        mut remaining: VecDeque<SocketAddr>,
        reply: mpsc::Sender<Result<ConnectionId>>,
        mut last_err: Option<TransportError>,
    ) {
        while let Some(addr) = remaining.pop_front() {
            let attempt = TcpStream::connect(addr).and_then(|mut stream| {
                self.poll.registry().register(
                    &mut stream,
                    SOCKET,
                    Interest::READABLE | Interest::WRITABLE,
                )?;
                Ok(stream)
            });
            match attempt {
                Ok(stream) => {
                    trace!(%addr, "connect in progress");
                    self.pending = Some(PendingConnect {
                        stream,
                        addr,
                        remaining,
                        reply,
                    });
                    return;
                }
                Err(source) => last_err = Some(TransportError::Connect { addr, source }),
            }
        }

        let err = last_err.unwrap_or_else(|| {
            TransportError::Resolve(io::Error::from(ErrorKind::InvalidInput))
        });
        let _ = reply.send(Err(err.into()));
    }

    fn connect_ready(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };

        let status = match pending.stream.take_error() {
            Ok(Some(err)) | Err(err) => Err(err),
            Ok(None) => match pending.stream.peer_addr() {
                Ok(_) => Ok(true),
                // Spurious wake-up: still connecting.
                Err(err) if err.kind() == ErrorKind::NotConnected => Ok(false),
                Err(err) => Err(err),
            },
        };

        if let Err(err) = self.poll.registry().deregister(&mut pending.stream) {
            trace!(error = %err, "deregister of connecting socket failed");
        }
        match status {
            Ok(false) => {
                let registered = self.poll.registry().register(
                    &mut pending.stream,
                    SOCKET,
                    Interest::READABLE | Interest::WRITABLE,
                );
                match registered {
                    Ok(()) => self.pending = Some(pending),
                    Err(source) => {
                        let last = TransportError::Connect {
                            addr: pending.addr,
                            source,
                        };
                        self.try_connect(pending.remaining, pending.reply, Some(last));
                    }
                }
            }
            Ok(true) => {
                let PendingConnect { stream, reply, .. } = pending;
                let _ = reply.send(self.admit(stream, Hook::Connect).map_err(PeerError::from));
            }
            Err(source) => {
                debug!(addr = %pending.addr, error = %source, "connect failed");
                let last = TransportError::Connect {
                    addr: pending.addr,
                    source,
                };
                self.try_connect(pending.remaining, pending.reply, Some(last));
            }
        }
    }

    /// Flush what the sockets will take, close everything and answer any
    /// caller still waiting on a connect.
    fn shutdown(&mut self) {
        self.handle.mark_stopped();
        debug!("event loop shutting down");

        if let Some(pending) = self.pending.take() {
            let _ = pending.reply.send(Err(PeerError::Stopped));
        }
        while let Ok(command) = self.queue.try_recv() {
            if let Command::Connect { reply, .. } = command {
                let _ = reply.send(Err(PeerError::Stopped));
            }
        }

        for (id, mut channel) in self.handle.registry().drain() {
            if let Err(err) = channel.flush() {
                trace!(%id, error = %err, "final flush failed");
            }
            channel.release(self.poll.registry());
            let (handler, link) = (&self.handler, &self.link);
            handler::guarded("on_close", id, || handler.on_close(link, id));
        }

        if let Role::Server(listener) = &mut self.role {
            if let Err(err) = self.poll.registry().deregister(listener) {
                trace!(error = %err, "deregister of listener failed");
            }
        }
        debug!("event loop stopped");
    }
}
