use tcpprims_frame::{FrameConfig, DEFAULT_MAX_PAYLOAD};

/// Default size of the scratch buffer the selector reads into: 16 KiB.
pub const DEFAULT_READ_BUFFER: usize = 16 * 1024;

/// Default number of readiness events collected per poll.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default number of `read` calls one connection gets per loop iteration.
pub const DEFAULT_READS_PER_PASS: usize = 16;

/// Runtime behavior shared by every transport.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Largest payload accepted in either direction. Default: 16 MiB.
    pub max_payload_size: usize,
    /// Set `TCP_NODELAY` on every connection. Default: true.
    pub nodelay: bool,
    /// Selector only: bytes read from a socket per `read` call.
    pub read_buffer_size: usize,
    /// Selector only: readiness events collected per poll.
    pub event_capacity: usize,
    /// Selector only: `read` calls a connection gets before the loop moves
    /// on to other sockets. A connection with data left is revisited on the
    /// next iteration.
    pub reads_per_pass: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_payload_size: DEFAULT_MAX_PAYLOAD,
            nodelay: true,
            read_buffer_size: DEFAULT_READ_BUFFER,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            reads_per_pass: DEFAULT_READS_PER_PASS,
        }
    }
}

impl PeerConfig {
    /// Frame codec settings derived from this configuration.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_payload_size: self.max_payload_size,
        }
    }
}
