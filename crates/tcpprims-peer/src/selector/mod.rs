//! Single-threaded readiness strategy.
//!
//! One event-loop thread owns the poller and every socket. Other threads
//! never touch a socket: `send`, `close`, `set_receiver` and client
//! `connect` are queued as commands and the loop is woken to run them.

mod channel;
mod client;
mod event_loop;
mod server;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};

use bytes::Bytes;
use mio::{Poll, Token, Waker};
use tcpprims_frame::FrameError;
use tracing::{trace, warn};

pub use client::SelectorClient;
pub use server::SelectorServer;

use self::channel::Channel;
use self::event_loop::EventLoop;
use crate::config::PeerConfig;
use crate::error::{PeerError, Result};
use crate::handler::ReceiveFn;
use crate::id::ConnectionId;
use crate::registry::Registry;
use crate::sync::lock;
use crate::transport::Transport;

/// The listening socket, or a client's connect in progress.
const SOCKET: Token = Token(0);
const WAKER: Token = Token(usize::MAX);

pub(crate) enum Command {
    Send(ConnectionId, Bytes),
    Close(ConnectionId),
    SetReceiver(ConnectionId, ReceiveFn),
    Connect {
        addrs: Vec<SocketAddr>,
        reply: mpsc::Sender<Result<ConnectionId>>,
    },
    Shutdown,
}

/// The caller-side half of an event loop: command queue, waker and the
/// shared registry.
#[derive(Clone)]
pub(crate) struct LoopHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    commands: mpsc::Sender<Command>,
    waker: Waker,
    registry: Arc<Registry<Channel>>,
    config: PeerConfig,
    stopped: AtomicBool,
    thread: Mutex<Option<JoinHandle<()>>>,
    thread_id: OnceLock<ThreadId>,
}

impl LoopHandle {
    fn new(poll: &Poll, config: PeerConfig) -> Result<(Self, mpsc::Receiver<Command>)> {
        let waker = Waker::new(poll.registry(), WAKER)?;
        let (commands, queue) = mpsc::channel();
        let handle = Self {
            inner: Arc::new(HandleInner {
                commands,
                waker,
                registry: Arc::new(Registry::new()),
                config,
                stopped: AtomicBool::new(false),
                thread: Mutex::new(None),
                thread_id: OnceLock::new(),
            }),
        };
        Ok((handle, queue))
    }

    fn spawn<L>(&self, name: &str, event_loop: EventLoop<L>) -> Result<()>
    where
        L: Transport + 'static,
    {
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || event_loop.run())?;
        let _ = self.inner.thread_id.set(handle.thread().id());
        *lock(&self.inner.thread) = Some(handle);
        Ok(())
    }

    fn registry(&self) -> &Arc<Registry<Channel>> {
        &self.inner.registry
    }

    fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    /// Record the calling thread as the loop thread. Runs first thing on the
    /// loop, so hooks never observe an unset id.
    fn bind_loop_thread(&self) {
        let _ = self.inner.thread_id.set(thread::current().id());
    }

    fn on_loop_thread(&self) -> bool {
        self.inner.thread_id.get() == Some(&thread::current().id())
    }

    fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Called by the loop itself when it exits for any reason.
    fn mark_stopped(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    fn submit(&self, command: Command) -> Result<()> {
        if self.is_stopped() {
            return Err(PeerError::Stopped);
        }
        self.inner
            .commands
            .send(command)
            .map_err(|_| PeerError::Stopped)?;
        self.inner.waker.wake()?;
        Ok(())
    }

    /// Submit a command whose only failure mode is a stopped loop, which
    /// the caller treats as a no-op.
    fn submit_quietly(&self, command: Command) {
        match self.submit(command) {
            Ok(()) | Err(PeerError::Stopped) => {}
            Err(err) => warn!(error = %err, "failed to wake event loop"),
        }
    }

    fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let max = self.inner.config.max_payload_size;
        if payload.len() > max {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max,
            }
            .into());
        }
        if !self.inner.registry.contains(id) {
            trace!(%id, "send to unknown connection ignored");
            return Ok(());
        }
        match self.submit(Command::Send(id, Bytes::copy_from_slice(payload))) {
            Err(PeerError::Stopped) => Ok(()),
            other => other,
        }
    }

    fn set_receiver(&self, id: ConnectionId, receiver: ReceiveFn) {
        self.submit_quietly(Command::SetReceiver(id, receiver));
    }

    fn close(&self, id: ConnectionId) {
        self.submit_quietly(Command::Close(id));
    }

    /// Request shutdown and, off the loop thread, wait for it to finish.
    /// A later call from another thread still waits for a shutdown that a
    /// hook requested.
    fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            // Bypasses `submit`, which refuses once stopped is set.
            let _ = self.inner.commands.send(Command::Shutdown);
            if let Err(err) = self.inner.waker.wake() {
                warn!(error = %err, "failed to wake event loop for shutdown");
            }
        }
        if self.on_loop_thread() {
            return;
        }
        let handle = lock(&self.inner.thread).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("event loop thread panicked");
            }
        }
    }

    fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }
}
