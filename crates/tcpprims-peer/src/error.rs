/// Errors that can occur in peer operations.
#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    /// Transport-level error (resolve, bind, connect, accept).
    #[error("transport error: {0}")]
    Transport(#[from] tcpprims_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] tcpprims_frame::FrameError),

    /// Thread spawn, multiplexer setup or wake-up failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been stopped.
    #[error("transport stopped")]
    Stopped,

    /// The operation would block the thread that must complete it.
    #[error("{0} called from the transport's own event thread")]
    EventThread(&'static str),
}

pub type Result<T> = std::result::Result<T, PeerError>;
