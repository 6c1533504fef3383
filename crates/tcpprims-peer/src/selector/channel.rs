use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr};

use bytes::{Buf, Bytes, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Registry as PollRegistry, Token};
use tcpprims_frame::{encode_frame, FrameDecoder, FrameError};
use tracing::trace;

use crate::config::PeerConfig;
use crate::handler::ReceiveFn;

/// How a read pass ended.
pub(super) enum ReadOutcome {
    /// Drained to `WouldBlock`; the connection stays open.
    Open,
    /// The read budget ran out before `WouldBlock`; more data may be waiting.
    Pending,
    /// Orderly end-of-stream.
    Eof,
    Fault(FrameError),
}

/// Per-socket state owned by the event loop.
pub(crate) struct Channel {
    stream: TcpStream,
    decoder: FrameDecoder,
    outbound: BytesMut,
    write_armed: bool,
    pub(super) receiver: Option<ReceiveFn>,
    pub(super) peer: Option<SocketAddr>,
}

impl Channel {
    pub(super) fn new(stream: TcpStream, config: &PeerConfig) -> Self {
        let peer = stream.peer_addr().ok();
        Self {
            stream,
            decoder: FrameDecoder::with_config(&config.frame_config()),
            outbound: BytesMut::new(),
            write_armed: false,
            receiver: None,
            peer,
        }
    }

    pub(super) fn register(&mut self, registry: &PollRegistry, token: Token) -> io::Result<()> {
        registry.register(&mut self.stream, token, Interest::READABLE)
    }

    /// Read until the socket would block or `budget` reads have returned
    /// data, decoding into `frames`.
    ///
    /// Frames completed before an end-of-stream or fault are still returned.
    pub(super) fn fill(
        &mut self,
        scratch: &mut [u8],
        budget: usize,
        frames: &mut Vec<Bytes>,
    ) -> ReadOutcome {
        let mut reads = 0;
        loop {
            if reads == budget.max(1) {
                return ReadOutcome::Pending;
            }
            match self.stream.read(scratch) {
                Ok(0) => {
                    return match self.decoder.finish() {
                        Ok(()) => ReadOutcome::Eof,
                        Err(err) => ReadOutcome::Fault(err),
                    }
                }
                Ok(n) => {
                    reads += 1;
                    if let Err(err) = self.decoder.feed(&scratch[..n], |frame| frames.push(frame)) {
                        return ReadOutcome::Fault(err);
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => return ReadOutcome::Open,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return ReadOutcome::Fault(err.into()),
            }
        }
    }

    /// Append one encoded frame to the outbound buffer.
    pub(super) fn enqueue(&mut self, payload: &[u8]) -> Result<(), FrameError> {
        encode_frame(payload, &mut self.outbound)
    }

    pub(super) fn is_write_armed(&self) -> bool {
        self.write_armed
    }

    /// Write as much buffered output as the socket takes. Returns whether
    /// the buffer is now empty.
    pub(super) fn flush(&mut self) -> io::Result<bool> {
        while !self.outbound.is_empty() {
            match self.stream.write(&self.outbound) {
                Ok(0) => return Err(ErrorKind::WriteZero.into()),
                Ok(n) => self.outbound.advance(n),
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(true)
    }

    /// Flush, then watch for writability only while output is pending.
    pub(super) fn flush_and_rearm(&mut self, registry: &PollRegistry, token: Token) -> io::Result<()> {
        let drained = self.flush()?;
        if drained == self.write_armed {
            let interest = if drained {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            registry.reregister(&mut self.stream, token, interest)?;
            self.write_armed = !drained;
        }
        Ok(())
    }

    /// Deregister and shut the socket down; the descriptor closes on drop.
    pub(super) fn release(mut self, registry: &PollRegistry) {
        if let Err(err) = registry.deregister(&mut self.stream) {
            trace!(error = %err, "deregister failed");
        }
        for how in [Shutdown::Read, Shutdown::Write] {
            if let Err(err) = self.stream.shutdown(how) {
                trace!(error = %err, ?how, "shutdown failed");
            }
        }
    }
}
