//! TV Local Session: remote control of a television on the LAN.

pub mod device_info;
pub mod messages;
pub mod session;

pub use device_info::{TvDeviceDetails, TvDeviceInfo};
pub use messages::{TvCommand, TvMethod, TvParams, TvResponse};
pub use session::{TV_REMOTE_PATH, TvEvents, TvLocalSession};
