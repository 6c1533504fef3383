/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed on a frame boundary.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection was closed part-way through a frame.
    #[error("connection closed mid-frame ({received} of {expected} bytes)")]
    Truncated { expected: usize, received: usize },

    /// A datagram chunk header is malformed or contradicts earlier chunks of
    /// the same message.
    #[error("invalid datagram chunk: {reason}")]
    InvalidChunk { reason: &'static str },

    /// The underlying socket failed.
    #[error(transparent)]
    Transport(#[from] tcpprims_transport::TransportError),
}

impl FrameError {
    /// Whether this error is a protocol violation by the peer, as opposed to
    /// an I/O failure or an orderly close.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            FrameError::PayloadTooLarge { .. } | FrameError::InvalidChunk { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
