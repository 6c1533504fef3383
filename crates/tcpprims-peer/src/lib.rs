//! High-level TCP connection management.
//!
//! This is the "just works" layer. Listen or connect with one of two
//! interchangeable strategies, address every peer by a [`ConnectionId`],
//! send framed payloads and receive them through a [`Handler`].
//!
//! - [`Strategy::Blocking`]: one acceptor thread plus one reader thread per
//!   connection; `send` writes on the caller's thread.
//! - [`Strategy::Selector`]: one thread drives a readiness multiplexer over
//!   every socket; `send` and `close` are queued for that thread.

pub mod blocking;
pub mod config;
pub mod error;
pub mod handler;
pub mod id;
pub mod registry;
pub mod selector;
mod sync;
pub mod transport;

pub use blocking::{BlockingClient, BlockingServer};
pub use config::PeerConfig;
pub use error::{PeerError, Result};
pub use handler::{Handler, ReceiveFn};
pub use id::ConnectionId;
pub use registry::Registry;
pub use selector::{SelectorClient, SelectorServer};
pub use transport::{Client, Server, Strategy, Transport};
