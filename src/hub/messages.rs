//! Hub-local wire schema: subscription commands out, device events in.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::LocalError;

/// A device attribute change streamed by the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HubLocalEvent {
    /// Device that changed.
    pub device_id: String,
    /// Component within the device, usually `"main"`.
    #[serde(default)]
    pub component: String,
    /// Capability the attribute belongs to, e.g. `"switch"`.
    #[serde(default)]
    pub capability: String,
    /// Attribute name, e.g. `"switch"`.
    #[serde(default)]
    pub attribute: String,
    /// New attribute value; any JSON type.
    #[serde(default)]
    pub value: Value,
    /// Measurement unit, when the attribute has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Event time as sent by the hub.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    /// Whether the value actually changed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_change: Option<bool>,
}

impl HubLocalEvent {
    /// Parses `timestamp` as RFC 3339.
    #[must_use]
    pub fn timestamp_utc(&self) -> Option<DateTime<Utc>> {
        let raw = self.timestamp.as_deref()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Error payload of a `{"messageType":"error"}` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubErrorPayload {
    /// Hub-defined error code.
    #[serde(default)]
    pub code: String,
    /// Human-readable message.
    #[serde(default)]
    pub message: String,
}

impl From<HubErrorPayload> for LocalError {
    fn from(payload: HubErrorPayload) -> Self {
        Self::Hub {
            code: payload.code,
            message: payload.message,
        }
    }
}

/// Raw inbound envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    message_type: String,
    #[serde(default)]
    device_event: Option<HubLocalEvent>,
    #[serde(default)]
    error: Option<HubErrorPayload>,
}

/// Inbound hub message, keyed by `messageType`.
#[derive(Debug, Clone, PartialEq)]
pub enum HubLocalMessage {
    /// `"deviceEvent"`.
    DeviceEvent(HubLocalEvent),
    /// `"error"`.
    Error(HubErrorPayload),
    /// Any other message type, carried by name.
    Other(String),
}

impl HubLocalMessage {
    /// Decodes one inbound JSON message.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Json`] if the envelope is malformed or the
    /// payload named by `messageType` is missing.
    pub fn from_value(value: Value) -> Result<Self, LocalError> {
        let envelope: Envelope = serde_json::from_value(value)?;
        match envelope.message_type.as_str() {
            "deviceEvent" => envelope
                .device_event
                .map(Self::DeviceEvent)
                .ok_or_else(|| missing_field("deviceEvent")),
            "error" => envelope
                .error
                .map(Self::Error)
                .ok_or_else(|| missing_field("error")),
            _ => Ok(Self::Other(envelope.message_type)),
        }
    }
}

fn missing_field(field: &'static str) -> LocalError {
    LocalError::Json(<serde_json::Error as serde::de::Error>::missing_field(field))
}

/// Outbound control message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HubCommandType {
    /// Start streaming events for the listed devices.
    Subscribe,
    /// Stop streaming events for the listed devices.
    Unsubscribe,
    /// Stream events for every device on the hub.
    SubscribeAll,
}

/// Outbound control message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubCommand {
    /// Command discriminator.
    pub message_type: HubCommandType,
    /// Target devices; absent for `subscribeAll`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_ids: Option<Vec<String>>,
}

impl HubCommand {
    /// `{"messageType":"subscribe","deviceIds":[...]}`.
    #[must_use]
    pub fn subscribe(device_ids: Vec<String>) -> Self {
        Self {
            message_type: HubCommandType::Subscribe,
            device_ids: Some(device_ids),
        }
    }

    /// `{"messageType":"unsubscribe","deviceIds":[...]}`.
    #[must_use]
    pub fn unsubscribe(device_ids: Vec<String>) -> Self {
        Self {
            message_type: HubCommandType::Unsubscribe,
            device_ids: Some(device_ids),
        }
    }

    /// `{"messageType":"subscribeAll"}`.
    #[must_use]
    pub const fn subscribe_all() -> Self {
        Self {
            message_type: HubCommandType::SubscribeAll,
            device_ids: None,
        }
    }
}
