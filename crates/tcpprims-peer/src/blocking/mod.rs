//! Thread-per-connection strategy.
//!
//! A server runs one acceptor thread; every connection gets its own reader
//! thread that blocks on the socket and dispatches complete payloads. Sends
//! run on the caller's thread under a per-connection write lock.

mod client;
mod connection;
mod server;

pub use client::BlockingClient;
pub use server::BlockingServer;
