//! TV-local wire schema: remote-control commands out, channel events in.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event that delivers the pairing token.
pub const EVENT_CHANNEL_CONNECT: &str = "ms.channel.connect";

/// Event sent when the user declines pairing on the TV.
pub const EVENT_CHANNEL_UNAUTHORIZED: &str = "ms.channel.unauthorized";

/// App id of the built-in browser.
pub const BROWSER_APP_ID: &str = "org.tizen.browser";

/// Launch action used for native apps such as the browser.
pub const ACTION_NATIVE_LAUNCH: &str = "NATIVE_LAUNCH";

/// Inbound TV message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TvResponse {
    /// Event name, e.g. `"ms.channel.connect"`.
    pub event: String,
    /// Event payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl TvResponse {
    /// Returns the pairing token carried by a `ms.channel.connect` event.
    ///
    /// `None` for any other event or when the token is missing or empty.
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        if self.event != EVENT_CHANNEL_CONNECT {
            return None;
        }
        self.data
            .as_ref()?
            .get("token")?
            .as_str()
            .filter(|token| !token.is_empty())
    }

    /// Returns `true` if the TV refused the pairing request.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        self.event == EVENT_CHANNEL_UNAUTHORIZED
    }
}

/// Outbound method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TvMethod {
    /// Key presses and text input.
    #[serde(rename = "ms.remote.control")]
    RemoteControl,
    /// Events addressed to a channel participant, such as app launches.
    #[serde(rename = "ms.channel.emit")]
    ChannelEmit,
}

/// Parameters of a `ms.remote.control` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct RemoteControlParams {
    /// Action, always `"Click"` here.
    pub cmd: String,
    /// Key code or base64 text.
    pub data_of_cmd: String,
    /// `"SendRemoteKey"` or `"SendInputString"`.
    pub type_of_remote: String,
}

/// Payload of an `ed.apps.launch` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchData {
    /// Target app id.
    #[serde(rename = "appId")]
    pub app_id: String,
    /// Launch action, e.g. `"DEEP_LINK"` or `"NATIVE_LAUNCH"`.
    pub action_type: String,
    /// App-specific argument such as a URL.
    #[serde(rename = "metaTag")]
    pub meta_tag: String,
}

/// Parameters of a `ms.channel.emit` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmitParams {
    /// Event name.
    pub event: String,
    /// Recipient; `"host"` is the TV itself.
    pub to: String,
    /// Event payload.
    pub data: LaunchData,
}

/// Command parameters, serialized without a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum TvParams {
    /// See [`RemoteControlParams`].
    RemoteControl(RemoteControlParams),
    /// See [`EmitParams`].
    Emit(EmitParams),
}

/// Outbound TV command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TvCommand {
    /// Method discriminator.
    pub method: TvMethod,
    /// Method parameters.
    pub params: TvParams,
}

impl TvCommand {
    /// A remote key press such as `"KEY_VOLUP"`.
    #[must_use]
    pub fn send_key(key: &str) -> Self {
        Self::remote_control(key.to_string(), "SendRemoteKey")
    }

    /// Text typed into the focused input field.
    #[must_use]
    pub fn send_text(text: &str) -> Self {
        Self::remote_control(BASE64.encode(text), "SendInputString")
    }

    /// Launches `app_id` with the given action and argument.
    #[must_use]
    pub fn launch_app(app_id: &str, action_type: &str, meta_tag: &str) -> Self {
        Self {
            method: TvMethod::ChannelEmit,
            params: TvParams::Emit(EmitParams {
                event: "ed.apps.launch".to_string(),
                to: "host".to_string(),
                data: LaunchData {
                    app_id: app_id.to_string(),
                    action_type: action_type.to_string(),
                    meta_tag: meta_tag.to_string(),
                },
            }),
        }
    }

    /// Opens `url` in the built-in browser.
    #[must_use]
    pub fn open_browser(url: &str) -> Self {
        Self::launch_app(BROWSER_APP_ID, ACTION_NATIVE_LAUNCH, url)
    }

    fn remote_control(data: String, kind: &str) -> Self {
        Self {
            method: TvMethod::RemoteControl,
            params: TvParams::RemoteControl(RemoteControlParams {
                cmd: "Click".to_string(),
                data_of_cmd: data,
                type_of_remote: kind.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;

    use super::*;

    fn response(value: Value) -> TvResponse {
        let Ok(resp) = serde_json::from_value(value) else {
            panic!("response did not decode");
        };
        resp
    }

    #[test]
    fn connect_event_yields_token() {
        let resp = response(json!({
            "event": "ms.channel.connect",
            "data": {"id": "abc", "token": "12345678", "clients": []}
        }));
        assert_eq!(resp.token(), Some("12345678"));
    }

    #[test]
    fn token_requires_connect_event_and_value() {
        let empty = response(json!({"event": "ms.channel.connect", "data": {"token": ""}}));
        assert_eq!(empty.token(), None);

        let no_data = response(json!({"event": "ms.channel.connect"}));
        assert_eq!(no_data.token(), None);

        let other = response(json!({"event": "ms.channel.clientConnect", "data": {"token": "x"}}));
        assert_eq!(other.token(), None);

        let refused = response(json!({"event": "ms.channel.unauthorized"}));
        assert!(refused.is_unauthorized());
    }

    #[test]
    fn send_key_shape() {
        let Ok(value) = serde_json::to_value(TvCommand::send_key("KEY_HOME")) else {
            panic!("command did not serialize");
        };
        assert_eq!(
            value,
            json!({
                "method": "ms.remote.control",
                "params": {"Cmd": "Click", "DataOfCmd": "KEY_HOME", "TypeOfRemote": "SendRemoteKey"}
            })
        );
    }

    #[test]
    fn send_text_is_base64() {
        let Ok(value) = serde_json::to_value(TvCommand::send_text("hello tv")) else {
            panic!("command did not serialize");
        };
        assert_eq!(value["params"]["DataOfCmd"], json!("aGVsbG8gdHY="));
        assert_eq!(value["params"]["TypeOfRemote"], json!("SendInputString"));
    }

    #[test]
    fn open_browser_targets_host() {
        let Ok(value) = serde_json::to_value(TvCommand::open_browser("https://example.com")) else {
            panic!("command did not serialize");
        };
        assert_eq!(
            value,
            json!({
                "method": "ms.channel.emit",
                "params": {
                    "event": "ed.apps.launch",
                    "to": "host",
                    "data": {
                        "appId": "org.tizen.browser",
                        "action_type": "NATIVE_LAUNCH",
                        "metaTag": "https://example.com"
                    }
                }
            })
        );
    }
}
