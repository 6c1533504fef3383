//! Chunked messages over UDP.
//!
//! A message larger than one datagram is split into chunks of at most
//! [`CHUNK_DATA_SIZE`] bytes. Every chunk carries the whole-message header so
//! the receiver can reassemble in any arrival order:
//!
//! ```text
//! ┌──────────────┬────────────┬─────────────┬──────────────┬────────────────┬───────────┐
//! │ Message id   │ Range size │ Range index │ Range length │ Content length │ Data      │
//! │ (32B ASCII)  │ (4B BE)    │ (4B BE, 1..)│ (4B BE)      │ (4B BE)        │ (≤ 32 KiB)│
//! └──────────────┴────────────┴─────────────┴──────────────┴────────────────┴───────────┘
//! ```
//!
//! Datagrams may carry padding after the chunk data; only `range length`
//! bytes are used. There is no retransmission: a message missing a chunk
//! stays pending until it is pushed out by newer messages.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tcpprims_transport::UdpEndpoint;
use tracing::{debug, trace, warn};

use crate::codec::DEFAULT_MAX_PAYLOAD;
use crate::error::{FrameError, Result};

/// Message id width: 32 ASCII digits.
pub const MESSAGE_ID_LEN: usize = 32;

/// Chunk header: id + range size + range index + range length + content length.
pub const CHUNK_HEADER_SIZE: usize = MESSAGE_ID_LEN + 16;

/// Largest data region of one chunk: 32 KiB.
pub const CHUNK_DATA_SIZE: usize = 32 * 1024;

/// Largest datagram the protocol produces or expects.
pub const MAX_DATAGRAM_SIZE: usize = CHUNK_HEADER_SIZE + CHUNK_DATA_SIZE;

/// Default number of partially received messages kept at once.
pub const DEFAULT_MAX_PENDING: usize = 64;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Identifies one chunked message.
///
/// Generated ids are the send time in milliseconds followed by a
/// per-process sequence number, as zero-padded decimal digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId([u8; MESSAGE_ID_LEN]);

impl MessageId {
    pub fn generate() -> Self {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or(0);
        let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000_000_000;
        let digits = format!("{:020}{sequence:012}", millis % 100_000_000_000_000_000_000);

        let mut id = [b'0'; MESSAGE_ID_LEN];
        id.copy_from_slice(digits.as_bytes());
        Self(id)
    }

    pub fn from_bytes(bytes: [u8; MESSAGE_ID_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; MESSAGE_ID_LEN] {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

/// Datagram protocol limits.
#[derive(Debug, Clone)]
pub struct DatagramConfig {
    /// Largest reassembled message accepted or sent. Default: 16 MiB.
    pub max_message_size: usize,
    /// Partially received messages kept before the oldest is dropped.
    pub max_pending: usize,
}

impl Default for DatagramConfig {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_PAYLOAD,
            max_pending: DEFAULT_MAX_PENDING,
        }
    }
}

/// The fixed part of every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub id: MessageId,
    /// Number of chunks in the message.
    pub range_size: u32,
    /// Position of this chunk, starting at 1.
    pub range_index: u32,
    /// Data bytes carried by this chunk.
    pub range_length: u32,
    /// Length of the whole message.
    pub content_length: u32,
}

impl ChunkHeader {
    /// Check the header against itself: every chunk but the last is full and
    /// the ranges add up to the content length.
    pub fn validate(&self, max_message_size: usize) -> Result<()> {
        let content = self.content_length as usize;
        if content > max_message_size {
            return Err(too_large(content, max_message_size));
        }
        if self.range_size as usize != chunk_count(content) {
            return Err(invalid("range size does not match content length"));
        }
        if self.range_index == 0 || self.range_index > self.range_size {
            return Err(invalid("range index out of bounds"));
        }
        let offset = (self.range_index as usize - 1) * CHUNK_DATA_SIZE;
        if self.range_length as usize != (content - offset).min(CHUNK_DATA_SIZE) {
            return Err(invalid("range length does not match its position"));
        }
        Ok(())
    }
}

/// One decoded datagram.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub header: ChunkHeader,
    pub data: Bytes,
}

fn chunk_count(content_length: usize) -> usize {
    content_length.div_ceil(CHUNK_DATA_SIZE).max(1)
}

fn too_large(size: usize, max: usize) -> FrameError {
    FrameError::PayloadTooLarge { size, max }
}

fn invalid(reason: &'static str) -> FrameError {
    FrameError::InvalidChunk { reason }
}

/// Split `payload` into ready-to-send datagrams.
///
/// An empty payload still produces one chunk so the receiver sees it.
pub fn encode_chunks(id: MessageId, payload: &[u8], max_message_size: usize) -> Result<Vec<Bytes>> {
    let max = max_message_size.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(too_large(payload.len(), max));
    }

    let range_size = chunk_count(payload.len());
    let mut datagrams = Vec::with_capacity(range_size);
    let mut pieces = payload.chunks(CHUNK_DATA_SIZE);
    for index in 1..=range_size {
        let data = pieces.next().unwrap_or_default();
        let mut datagram = BytesMut::with_capacity(CHUNK_HEADER_SIZE + data.len());
        datagram.put_slice(id.as_bytes());
        datagram.put_u32(range_size as u32);
        datagram.put_u32(index as u32);
        datagram.put_u32(data.len() as u32);
        datagram.put_u32(payload.len() as u32);
        datagram.put_slice(data);
        datagrams.push(datagram.freeze());
    }
    Ok(datagrams)
}

/// Parse and [validate](ChunkHeader::validate) one datagram.
///
/// A content length over `max_message_size` is rejected before anything is
/// buffered.
pub fn decode_chunk(datagram: &[u8], max_message_size: usize) -> Result<Chunk> {
    if datagram.len() < CHUNK_HEADER_SIZE {
        return Err(invalid("datagram shorter than chunk header"));
    }

    let mut fields = &datagram[..CHUNK_HEADER_SIZE];
    let mut id = [0u8; MESSAGE_ID_LEN];
    fields.copy_to_slice(&mut id);
    let header = ChunkHeader {
        id: MessageId(id),
        range_size: fields.get_u32(),
        range_index: fields.get_u32(),
        range_length: fields.get_u32(),
        content_length: fields.get_u32(),
    };
    header.validate(max_message_size)?;

    let len = header.range_length as usize;
    let data = &datagram[CHUNK_HEADER_SIZE..];
    if data.len() < len {
        return Err(invalid("datagram shorter than its range length"));
    }

    Ok(Chunk {
        header,
        data: Bytes::copy_from_slice(&data[..len]),
    })
}

struct Partial {
    range_size: u32,
    content_length: u32,
    parts: Vec<Option<Bytes>>,
    received: usize,
}

/// Collects chunks by message id and hands back each message once every
/// chunk has arrived.
///
/// Memory is bounded twice: a message is never larger than
/// `max_message_size`, and at most `max_pending` messages are incomplete at
/// once. When a new message would exceed that, the oldest is dropped.
pub struct Reassembler {
    config: DatagramConfig,
    pending: HashMap<MessageId, Partial>,
    order: VecDeque<MessageId>,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::with_config(DatagramConfig::default())
    }

    pub fn with_config(config: DatagramConfig) -> Self {
        Self {
            config,
            pending: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    /// Decode `datagram` and [`push`](Self::push) it.
    pub fn push_datagram(&mut self, datagram: &[u8]) -> Result<Option<(MessageId, Bytes)>> {
        let chunk = decode_chunk(datagram, self.config.max_message_size)?;
        self.push(chunk)
    }

    /// Add one chunk. Returns the message it completes, if any.
    ///
    /// Duplicate chunks are ignored. A chunk whose header disagrees with
    /// earlier chunks of the same id drops that message and is an error.
    pub fn push(&mut self, chunk: Chunk) -> Result<Option<(MessageId, Bytes)>> {
        let Chunk { header, data } = chunk;
        if let Err(err) = header.validate(self.config.max_message_size) {
            self.forget(&header.id);
            return Err(err);
        }
        if data.len() != header.range_length as usize {
            self.forget(&header.id);
            return Err(invalid("chunk data does not match its range length"));
        }

        if header.range_size == 1 {
            return Ok(Some((header.id, data)));
        }

        if !self.pending.contains_key(&header.id) {
            self.make_room();
            self.order.push_back(header.id);
            self.pending.insert(
                header.id,
                Partial {
                    range_size: header.range_size,
                    content_length: header.content_length,
                    parts: vec![None; header.range_size as usize],
                    received: 0,
                },
            );
        }

        let Some(partial) = self.pending.get_mut(&header.id) else {
            return Ok(None);
        };
        if partial.range_size != header.range_size
            || partial.content_length != header.content_length
        {
            self.forget(&header.id);
            return Err(invalid("chunk disagrees with earlier chunks of its message"));
        }

        let slot = &mut partial.parts[header.range_index as usize - 1];
        if slot.is_some() {
            trace!(id = %header.id, index = header.range_index, "duplicate chunk ignored");
            return Ok(None);
        }
        *slot = Some(data);
        partial.received += 1;
        if partial.received < partial.parts.len() {
            return Ok(None);
        }

        let Some(partial) = self.forget(&header.id) else {
            return Ok(None);
        };
        let mut message = BytesMut::with_capacity(partial.content_length as usize);
        for part in partial.parts.into_iter().flatten() {
            message.put_slice(&part);
        }
        debug!(id = %header.id, size = message.len(), "message reassembled");
        Ok(Some((header.id, message.freeze())))
    }

    /// Messages with at least one chunk missing.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn make_room(&mut self) {
        while self.pending.len() >= self.config.max_pending.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            if let Some(dropped) = self.pending.remove(&oldest) {
                warn!(
                    id = %oldest,
                    received = dropped.received,
                    chunks = dropped.range_size,
                    "dropping incomplete message"
                );
            }
        }
    }

    fn forget(&mut self, id: &MessageId) -> Option<Partial> {
        let partial = self.pending.remove(id)?;
        self.order.retain(|queued| queued != id);
        Some(partial)
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sends chunked messages to one destination.
pub struct DatagramSender {
    endpoint: UdpEndpoint,
    target: SocketAddr,
    config: DatagramConfig,
}

impl DatagramSender {
    pub fn new(endpoint: UdpEndpoint, target: SocketAddr) -> Self {
        Self::with_config(endpoint, target, DatagramConfig::default())
    }

    pub fn with_config(endpoint: UdpEndpoint, target: SocketAddr, config: DatagramConfig) -> Self {
        Self {
            endpoint,
            target,
            config,
        }
    }

    /// Send `payload` as one message under a fresh id.
    pub fn send(&self, payload: &[u8]) -> Result<MessageId> {
        let id = MessageId::generate();
        let datagrams = encode_chunks(id, payload, self.config.max_message_size)?;
        for datagram in &datagrams {
            self.endpoint.send_to(datagram, self.target)?;
        }
        trace!(%id, chunks = datagrams.len(), target = %self.target, "message sent");
        Ok(id)
    }

    pub fn endpoint(&self) -> &UdpEndpoint {
        &self.endpoint
    }
}

/// Receives datagrams and yields reassembled messages.
pub struct DatagramReceiver {
    endpoint: UdpEndpoint,
    reassembler: Reassembler,
    buf: Vec<u8>,
}

impl DatagramReceiver {
    pub fn new(endpoint: UdpEndpoint) -> Self {
        Self::with_config(endpoint, DatagramConfig::default())
    }

    pub fn with_config(endpoint: UdpEndpoint, config: DatagramConfig) -> Self {
        Self {
            endpoint,
            reassembler: Reassembler::with_config(config),
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }
    }

    /// Block until a whole message has arrived.
    ///
    /// Anyone can send to a UDP socket, so malformed or oversized chunks are
    /// logged and skipped. Only socket errors are returned.
    pub fn recv(&mut self) -> Result<(MessageId, Bytes)> {
        loop {
            let (n, from) = self.endpoint.recv_from(&mut self.buf)?;
            match self.reassembler.push_datagram(&self.buf[..n]) {
                Ok(Some(message)) => return Ok(message),
                Ok(None) => {}
                Err(err) => warn!(%from, error = %err, "discarding datagram"),
            }
        }
    }

    /// Hand every message to `on_message` until the socket fails.
    pub fn for_each_message(&mut self, mut on_message: impl FnMut(MessageId, Bytes)) -> Result<()> {
        loop {
            let (id, message) = self.recv()?;
            on_message(id, message);
        }
    }

    pub fn endpoint(&self) -> &UdpEndpoint {
        &self.endpoint
    }

    /// Messages still waiting for chunks.
    pub fn pending(&self) -> usize {
        self.reassembler.pending()
    }
}
