//! WebSocket protocol engine (client role, RFC 6455 subset).
//!
//! Leaves first: the frame codec, the upgrade handshake, transport dialing,
//! the inbound queue, and the connection session that ties them together.

pub mod connection;
pub mod frame;
pub mod handshake;
pub mod queue;
pub mod tls;

#[cfg(test)]
pub(crate) mod mock_peer;

pub use connection::{Connection, ConnectionConfig, Endpoint, Inbound, KeepaliveConfig};
pub use frame::{Frame, FrameError, OpCode};
pub use tls::TlsPolicy;
