//! Hub Local Session: device events streamed from a home hub on the LAN.

pub mod messages;
pub mod session;
pub mod subscription;

pub use messages::{HubCommand, HubCommandType, HubErrorPayload, HubLocalEvent, HubLocalMessage};
pub use session::{HUB_EVENTS_PATH, HubEvents, HubLocalSession};
pub use subscription::SubscriptionManager;
