#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tcpprims_frame::{FrameReader, FrameWriter};
use tcpprims_peer::{ConnectionId, Handler, Strategy, Transport};
use tcpprims_transport::TcpConnection;

pub const STRATEGIES: [Strategy; 2] = [Strategy::Blocking, Strategy::Selector];

const WAIT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Accept(ConnectionId),
    Connect(ConnectionId),
    Receive(ConnectionId, Bytes),
    Close(ConnectionId),
}

/// Records every hook invocation; optionally echoes payloads back.
#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
    changed: Condvar,
    echo: bool,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn echoing() -> Arc<Self> {
        Arc::new(Self {
            echo: true,
            ..Self::default()
        })
    }

    pub fn handler(self: &Arc<Self>) -> Recording {
        Recording(Arc::clone(self))
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
        self.changed.notify_all();
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Block until `done` holds for the recorded events; panics after a
    /// generous timeout so a hung transport fails the test.
    pub fn wait_until(&self, what: &str, done: impl Fn(&[Event]) -> bool) -> Vec<Event> {
        let guard = self.events.lock().unwrap();
        let (guard, timeout) = self
            .changed
            .wait_timeout_while(guard, WAIT, |events| !done(events))
            .unwrap();
        assert!(!timeout.timed_out(), "timed out waiting for {what}: {:?}", *guard);
        guard.clone()
    }

    pub fn wait_for_accepts(&self, n: usize) -> Vec<ConnectionId> {
        let events = self.wait_until("accepts", |events| accepted(events).len() >= n);
        accepted(&events)
    }

    pub fn wait_for_payloads(&self, id: ConnectionId, n: usize) -> Vec<Bytes> {
        let events = self.wait_until("payloads", |events| received(events, id).len() >= n);
        received(&events, id)
    }

    pub fn wait_for_close(&self, id: ConnectionId) {
        self.wait_until("close", |events| events.contains(&Event::Close(id)));
    }

    pub fn close_count(&self, id: ConnectionId) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == Event::Close(id))
            .count()
    }
}

pub fn accepted(events: &[Event]) -> Vec<ConnectionId> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Accept(id) => Some(*id),
            _ => None,
        })
        .collect()
}

pub fn received(events: &[Event], id: ConnectionId) -> Vec<Bytes> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Receive(from, payload) if *from == id => Some(payload.clone()),
            _ => None,
        })
        .collect()
}

pub struct Recording(Arc<Recorder>);

impl Handler for Recording {
    fn on_accept(&self, _link: &dyn Transport, id: ConnectionId) {
        self.0.push(Event::Accept(id));
    }

    fn on_connect(&self, _link: &dyn Transport, id: ConnectionId) {
        self.0.push(Event::Connect(id));
    }

    fn on_receive(&self, link: &dyn Transport, id: ConnectionId, payload: Bytes) {
        if self.0.echo {
            let _ = link.send(id, &payload);
        }
        self.0.push(Event::Receive(id, payload));
    }

    fn on_close(&self, _link: &dyn Transport, id: ConnectionId) {
        self.0.push(Event::Close(id));
    }
}

/// A plain framed socket standing in for a peer.
pub struct RawPeer {
    pub reader: FrameReader<TcpConnection>,
    pub writer: FrameWriter<TcpConnection>,
    pub stream: TcpConnection,
}

impl RawPeer {
    pub fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpConnection::connect(addr).expect("raw peer should connect");
        Self {
            reader: FrameReader::new(stream.try_clone().expect("clone should succeed")),
            writer: FrameWriter::new(stream.try_clone().expect("clone should succeed")),
            stream,
        }
    }

    pub fn send(&mut self, payload: &[u8]) {
        self.writer.send(payload).expect("raw send should succeed");
    }

    pub fn recv(&mut self) -> Bytes {
        self.reader.read_frame().expect("raw read should succeed")
    }
}

/// A raw peer writing one payload as fast as the server takes it, while a
/// second thread drains whatever comes back.
pub struct Flooder {
    running: Arc<AtomicBool>,
    control: TcpConnection,
    writer: JoinHandle<usize>,
    reader: JoinHandle<usize>,
}

impl Flooder {
    pub fn start(addr: SocketAddr, payload: &'static [u8]) -> Self {
        let RawPeer {
            mut reader,
            mut writer,
            stream,
        } = RawPeer::connect(addr);
        let running = Arc::new(AtomicBool::new(true));

        let flag = Arc::clone(&running);
        let writer = thread::spawn(move || {
            let mut sent = 0;
            while flag.load(Ordering::Relaxed) && writer.send(payload).is_ok() {
                sent += 1;
            }
            sent
        });
        let reader = thread::spawn(move || {
            let mut received = 0;
            while reader.read_frame().is_ok() {
                received += 1;
            }
            received
        });

        Self {
            running,
            control: stream,
            writer,
            reader,
        }
    }

    /// Stop writing, shut the socket and return the frames sent and received.
    pub fn finish(self) -> (usize, usize) {
        self.running.store(false, Ordering::Relaxed);
        self.control.shutdown_quietly();
        let sent = self.writer.join().expect("flood writer should not panic");
        let received = self.reader.join().expect("flood reader should not panic");
        (sent, received)
    }
}

pub fn ignore() -> impl Handler {
    |_: &dyn Transport, _: ConnectionId, _: Bytes| {}
}
