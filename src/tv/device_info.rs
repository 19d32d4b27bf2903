//! TV device descriptor fetched over the TV's REST endpoint.
//!
//! This is a single HTTP GET next to the WebSocket channel, using the same
//! host, port, and certificate trust policy.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::LocalError;
use crate::ws::TlsPolicy;

/// Request target of the device descriptor.
pub const DEVICE_INFO_PATH: &str = "/api/v2/";

/// Timeout of the device-info request.
pub const DEVICE_INFO_TIMEOUT: Duration = Duration::from_secs(10);

/// Hardware and network details reported by the TV.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvDeviceDetails {
    /// Model code.
    #[serde(rename = "modelName")]
    pub model_name: String,
    /// User-visible device name.
    pub name: String,
    /// Operating system, e.g. `"Tizen"`.
    #[serde(rename = "OS")]
    pub os: String,
    /// Power state, e.g. `"on"` or `"standby"`.
    #[serde(rename = "PowerState")]
    pub power_state: String,
    /// Screen resolution.
    pub resolution: String,
    /// `"wired"` or `"wireless"`.
    #[serde(rename = "networkType")]
    pub network_type: String,
    /// Wi-Fi MAC address.
    #[serde(rename = "wifiMac")]
    pub wifi_mac: String,
    /// `"true"` when the TV supports token pairing.
    #[serde(rename = "TokenAuthSupport")]
    pub token_auth_support: String,
}

/// Device descriptor returned by `GET /api/v2/`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TvDeviceInfo {
    /// Device UUID.
    pub id: String,
    /// Friendly name.
    pub name: String,
    /// API version string.
    pub version: String,
    /// Device type, e.g. `"Samsung SmartTV"`.
    #[serde(rename = "type")]
    pub device_type: String,
    /// Base URI of the REST API.
    pub uri: String,
    /// Hardware details.
    pub device: TvDeviceDetails,
}

/// Fetches the device descriptor from `host:port`.
///
/// # Errors
///
/// Returns [`LocalError::Http`] if the client cannot be built, the request
/// fails, the status is not 2xx, or the body is not a device descriptor.
pub async fn fetch(
    host: &str,
    port: u16,
    secure: bool,
    policy: TlsPolicy,
) -> Result<TvDeviceInfo, LocalError> {
    let scheme = if secure { "https" } else { "http" };
    let url = format!("{scheme}://{host}:{port}{DEVICE_INFO_PATH}");
    let client = reqwest::Client::builder()
        .danger_accept_invalid_certs(policy.accepts_invalid_certs())
        .timeout(DEVICE_INFO_TIMEOUT)
        .build()?;

    tracing::debug!(host, port, secure, "fetching TV device info");
    let info = client
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json::<TvDeviceInfo>()
        .await?;
    Ok(info)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[tokio::test]
    async fn fetch_decodes_descriptor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v2/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "uuid:1234",
                "name": "Living Room",
                "version": "2.0.25",
                "type": "Samsung SmartTV",
                "uri": "http://127.0.0.1:8001/api/v2/",
                "isSupport": "{}",
                "device": {
                    "modelName": "QE55Q80",
                    "name": "Living Room",
                    "OS": "Tizen",
                    "PowerState": "on",
                    "networkType": "wireless",
                    "TokenAuthSupport": "true"
                }
            })))
            .mount(&server)
            .await;

        let port = server.address().port();
        let Ok(info) = fetch("127.0.0.1", port, false, TlsPolicy::default()).await else {
            panic!("device info request failed");
        };
        assert_eq!(info.name, "Living Room");
        assert_eq!(info.device_type, "Samsung SmartTV");
        assert_eq!(info.device.model_name, "QE55Q80");
        assert_eq!(info.device.token_auth_support, "true");
        assert!(info.device.wifi_mac.is_empty());
    }

    #[tokio::test]
    async fn error_status_is_http_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let port = server.address().port();
        let result = fetch("127.0.0.1", port, false, TlsPolicy::default()).await;
        let Err(err) = result else {
            panic!("503 should fail");
        };
        assert_eq!(err.kind(), "http");
        assert!(!err.is_fatal());
    }
}
