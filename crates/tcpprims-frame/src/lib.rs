//! Length-prefixed message framing.
//!
//! Every message is framed with a 4-byte big-endian payload length followed
//! by exactly that many payload bytes. There is no magic number, version or
//! separator.
//!
//! Two decoding styles share the same wire format:
//! - [`FrameReader`] pulls whole frames from a blocking `Read` stream.
//! - [`FrameDecoder`] is fed whatever bytes a non-blocking read produced and
//!   keeps partial frames across calls.
//!
//! [`datagram`] carries messages over UDP instead, split into 32 KiB chunks
//! and reassembled by message id.

pub mod codec;
pub mod datagram;
pub mod decoder;
pub mod error;
pub mod reader;
pub mod writer;

pub use bytes::{Bytes, BytesMut};
pub use codec::{decode_frame, encode_frame, FrameConfig, DEFAULT_MAX_PAYLOAD, HEADER_SIZE};
pub use datagram::{
    decode_chunk, encode_chunks, DatagramConfig, DatagramReceiver, DatagramSender, MessageId,
    Reassembler,
};
pub use decoder::{DecodeState, FrameDecoder};
pub use error::{FrameError, Result};
pub use reader::FrameReader;
pub use writer::FrameWriter;
