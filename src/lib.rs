//! # smartthings-local
//!
//! Local-network control of smart-home devices over push-style WebSocket
//! channels, without going through the cloud API.
//!
//! The crate carries its own client-side WebSocket engine (RFC 6455 subset)
//! and two thin protocols built on it: the hub's local event stream and a
//! television's remote-control channel.
//!
//! ## Architecture
//!
//! ```text
//! Caller
//!     │
//!     ├── HubLocalSession (hub/)    subscribe, device events
//!     ├── TvLocalSession (tv/)      keys, text, apps, pairing token
//!     │
//!     ├── Connection (ws/)          read loop, keepalive loop, send path
//!     │
//!     ├── Handshake (ws/)           HTTP/1.1 Upgrade
//!     ├── Frame codec (ws/)         masking, extended lengths
//!     │
//!     └── TCP / TLS transport (ws/)
//! ```

pub mod config;
pub mod error;
pub mod hub;
pub mod tv;
pub mod ws;

pub use config::{HubLocalConfig, TvLocalConfig};
pub use error::LocalError;
pub use hub::{HubEvents, HubLocalEvent, HubLocalSession};
pub use tv::{TvEvents, TvLocalSession, TvResponse};
pub use ws::TlsPolicy;
