//! Socket primitives.
//!
//! This is the lowest layer of tcpprims. It owns address resolution,
//! binding, accepting and connecting, and hands out [`TcpConnection`]
//! streams that everything above frames messages on. [`UdpEndpoint`]
//! carries the chunked datagram protocol.

pub mod error;
pub mod listener;
pub mod stream;
pub mod udp;

pub use error::{Result, TransportError};
pub use listener::{resolve, wake_addr, TcpSocketListener};
pub use stream::TcpConnection;
pub use udp::UdpEndpoint;
