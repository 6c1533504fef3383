//! Length-prefixed TCP messaging with two interchangeable I/O strategies.
//!
//! tcpprims sends discrete byte payloads over TCP, each framed by a 4-byte
//! big-endian length, and manages many connections behind small integer ids.
//! Servers and clients run either thread-per-connection or on a single
//! readiness-driven event loop, with the same callbacks and the same wire
//! format.
//!
//! # Crate Structure
//!
//! - [`transport`]: TCP listener and stream wrappers
//! - [`frame`]: length-prefix codec, blocking reader/writer, resumable decoder
//! - [`peer`]: connection registry, handlers, blocking and selector transports
//!   (behind the `peer` feature)

/// Re-export transport types.
pub mod transport {
    pub use tcpprims_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use tcpprims_frame::*;
}

/// Re-export peer types (requires `peer` feature).
#[cfg(feature = "peer")]
pub mod peer {
    pub use tcpprims_peer::*;
}
