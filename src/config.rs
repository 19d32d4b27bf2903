//! Session configuration loaded from code or environment variables.
//!
//! Follows 12-factor style: [`HubLocalConfig::from_env`] and
//! [`TvLocalConfig::from_env`] read environment variables (or a `.env` file
//! via `dotenvy`). Parsing goes through `from_lookup`, which takes any
//! key-to-value function so it can be exercised without touching the
//! process environment.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LocalError;
use crate::ws::TlsPolicy;
use crate::ws::connection::DEFAULT_CONNECT_TIMEOUT;

/// Default hub LAN port.
pub const DEFAULT_HUB_PORT: u16 = 39500;

/// Default capacity of the hub event stream.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

/// TV port serving the TLS remote-control channel.
pub const TV_SECURE_PORT: u16 = 8002;

/// TV port serving the plain remote-control channel.
pub const TV_PLAIN_PORT: u16 = 8001;

/// Client name shown on the TV pairing prompt.
pub const DEFAULT_TV_APP_NAME: &str = "SmartThings Local";

/// Default ping interval on TV sessions.
pub const DEFAULT_TV_KEEPALIVE: Duration = Duration::from_secs(30);

/// Default capacity of the TV response stream.
pub const DEFAULT_RESPONSE_BUFFER_SIZE: usize = 100;

/// Callback invoked with a freshly issued TV pairing token.
pub type TokenCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Hub-local session configuration.
#[derive(Clone)]
pub struct HubLocalConfig {
    /// Hub IP address or host name.
    pub hub_ip: String,
    /// Hub port.
    pub hub_port: u16,
    /// Bearer token sent with the upgrade request.
    pub token: String,
    /// Capacity of the event stream; newer events are dropped when full.
    pub event_buffer_size: usize,
    /// Connect with TLS.
    pub secure: bool,
    /// Certificate trust policy for TLS connections.
    pub tls: TlsPolicy,
    /// Bound on dial plus handshake.
    pub connect_timeout: Duration,
}

impl fmt::Debug for HubLocalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HubLocalConfig")
            .field("hub_ip", &self.hub_ip)
            .field("hub_port", &self.hub_port)
            .field("token", &"<redacted>")
            .field("event_buffer_size", &self.event_buffer_size)
            .field("secure", &self.secure)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

impl HubLocalConfig {
    /// Creates a config with default port, buffer and a plain transport.
    #[must_use]
    pub fn new(hub_ip: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            hub_ip: hub_ip.into(),
            hub_port: DEFAULT_HUB_PORT,
            token: token.into(),
            event_buffer_size: DEFAULT_EVENT_BUFFER_SIZE,
            secure: false,
            tls: TlsPolicy::AcceptInvalidCerts,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Overrides the hub port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.hub_port = port;
        self
    }

    /// Overrides the event stream capacity.
    #[must_use]
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    /// Switches TLS on or off.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Sets the certificate trust policy.
    #[must_use]
    pub fn with_tls_policy(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Rejects empty host or token before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), LocalError> {
        if self.hub_ip.trim().is_empty() {
            return Err(LocalError::InvalidConfig("hub IP is required".to_string()));
        }
        if self.token.trim().is_empty() {
            return Err(LocalError::InvalidConfig("hub token is required".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// See [`HubLocalConfig::from_lookup`].
    pub fn from_env() -> Result<Self, LocalError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`, falling back to defaults for optional
    /// keys that are missing or invalid.
    ///
    /// | Key                             | Default |
    /// |---------------------------------|---------|
    /// | `SMARTTHINGS_HUB_IP`            | required |
    /// | `SMARTTHINGS_HUB_TOKEN`         | required |
    /// | `SMARTTHINGS_HUB_PORT`          | 39500   |
    /// | `SMARTTHINGS_HUB_SECURE`        | false   |
    /// | `SMARTTHINGS_EVENT_BUFFER_SIZE` | 100     |
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] if a required key is missing or
    /// empty.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LocalError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let hub_ip = lookup("SMARTTHINGS_HUB_IP").unwrap_or_default();
        let token = lookup("SMARTTHINGS_HUB_TOKEN").unwrap_or_default();

        let config = Self::new(hub_ip, token)
            .with_port(parse_env(&lookup, "SMARTTHINGS_HUB_PORT", DEFAULT_HUB_PORT))
            .with_secure(parse_env_bool(&lookup, "SMARTTHINGS_HUB_SECURE", false))
            .with_event_buffer_size(parse_env(
                &lookup,
                "SMARTTHINGS_EVENT_BUFFER_SIZE",
                DEFAULT_EVENT_BUFFER_SIZE,
            ));
        config.validate()?;
        Ok(config)
    }
}

/// TV-local session configuration.
#[derive(Clone)]
pub struct TvLocalConfig {
    /// TV IP address or host name.
    pub tv_ip: String,
    /// Remote-control port.
    pub port: u16,
    /// Pairing token from a previous session, if any.
    pub token: Option<String>,
    /// Client name shown on the pairing prompt.
    pub app_name: String,
    /// Explicit TLS switch; `None` means TLS iff `port` is [`TV_SECURE_PORT`].
    pub secure: Option<bool>,
    /// Certificate trust policy for TLS connections.
    pub tls: TlsPolicy,
    /// Ping interval; `None` disables client keepalive.
    pub keepalive_interval: Option<Duration>,
    /// Capacity of the response stream.
    pub response_buffer_size: usize,
    /// Bound on dial plus handshake.
    pub connect_timeout: Duration,
    /// Invoked with each newly issued pairing token.
    pub on_token_received: Option<TokenCallback>,
}

impl fmt::Debug for TvLocalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TvLocalConfig")
            .field("tv_ip", &self.tv_ip)
            .field("port", &self.port)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("app_name", &self.app_name)
            .field("secure", &self.is_secure())
            .field("tls", &self.tls)
            .field("keepalive_interval", &self.keepalive_interval)
            .field("on_token_received", &self.on_token_received.is_some())
            .finish_non_exhaustive()
    }
}

impl TvLocalConfig {
    /// Creates a config targeting the secure port with default settings.
    #[must_use]
    pub fn new(tv_ip: impl Into<String>) -> Self {
        Self {
            tv_ip: tv_ip.into(),
            port: TV_SECURE_PORT,
            token: None,
            app_name: DEFAULT_TV_APP_NAME.to_string(),
            secure: None,
            tls: TlsPolicy::AcceptInvalidCerts,
            keepalive_interval: Some(DEFAULT_TV_KEEPALIVE),
            response_buffer_size: DEFAULT_RESPONSE_BUFFER_SIZE,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            on_token_received: None,
        }
    }

    /// Overrides the port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Supplies a token from an earlier pairing.
    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Overrides the client name.
    #[must_use]
    pub fn with_app_name(mut self, app_name: impl Into<String>) -> Self {
        self.app_name = app_name.into();
        self
    }

    /// Forces TLS on or off regardless of the port.
    #[must_use]
    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = Some(secure);
        self
    }

    /// Sets the certificate trust policy.
    #[must_use]
    pub fn with_tls_policy(mut self, tls: TlsPolicy) -> Self {
        self.tls = tls;
        self
    }

    /// Sets or disables the keepalive interval.
    #[must_use]
    pub fn with_keepalive_interval(mut self, interval: Option<Duration>) -> Self {
        self.keepalive_interval = interval;
        self
    }

    /// Registers the pairing token callback.
    #[must_use]
    pub fn with_token_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_token_received = Some(Arc::new(callback));
        self
    }

    /// Returns whether the session uses TLS.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure.unwrap_or(self.port == TV_SECURE_PORT)
    }

    /// Rejects an empty host or app name before any I/O.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), LocalError> {
        if self.tv_ip.trim().is_empty() {
            return Err(LocalError::InvalidConfig("TV IP is required".to_string()));
        }
        if self.app_name.trim().is_empty() {
            return Err(LocalError::InvalidConfig("app name must not be empty".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// See [`TvLocalConfig::from_lookup`].
    pub fn from_env() -> Result<Self, LocalError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from `lookup`.
    ///
    /// | Key                             | Default              |
    /// |---------------------------------|----------------------|
    /// | `SMARTTHINGS_TV_IP`             | required             |
    /// | `SMARTTHINGS_TV_PORT`           | 8002                 |
    /// | `SMARTTHINGS_TV_TOKEN`          | none                 |
    /// | `SMARTTHINGS_TV_APP_NAME`       | `"SmartThings Local"`|
    /// | `SMARTTHINGS_TV_SECURE`         | port == 8002         |
    /// | `SMARTTHINGS_TV_KEEPALIVE_SECS` | 30 (0 disables)      |
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] if the IP is missing.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, LocalError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(lookup("SMARTTHINGS_TV_IP").unwrap_or_default())
            .with_port(parse_env(&lookup, "SMARTTHINGS_TV_PORT", TV_SECURE_PORT));

        if let Some(token) = lookup("SMARTTHINGS_TV_TOKEN").filter(|t| !t.is_empty()) {
            config = config.with_token(token);
        }
        if let Some(name) = lookup("SMARTTHINGS_TV_APP_NAME").filter(|n| !n.is_empty()) {
            config = config.with_app_name(name);
        }
        config.secure = lookup("SMARTTHINGS_TV_SECURE").and_then(|v| parse_bool(&v));

        let keepalive_secs = parse_env(
            &lookup,
            "SMARTTHINGS_TV_KEEPALIVE_SECS",
            DEFAULT_TV_KEEPALIVE.as_secs(),
        );
        config.keepalive_interval = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));

        config.validate()?;
        Ok(config)
    }
}

/// Parses `key` as `T`, returning `default` on missing or invalid values.
fn parse_env<T, F>(lookup: &F, key: &str, default: T) -> T
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Accepts `"true"`, `"1"`, `"false"`, `"0"` (case-insensitive).
fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" => Some(true),
        "false" | "0" => Some(false),
        _ => None,
    }
}

/// Parses `key` as a boolean, returning `default` otherwise.
fn parse_env_bool<F>(lookup: &F, key: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).and_then(|v| parse_bool(&v)).unwrap_or(default)
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn hub_defaults_apply() {
        let lookup = lookup_from(&[
            ("SMARTTHINGS_HUB_IP", "192.168.1.10"),
            ("SMARTTHINGS_HUB_TOKEN", "tok"),
        ]);
        let Ok(config) = HubLocalConfig::from_lookup(lookup) else {
            panic!("config should load");
        };
        assert_eq!(config.hub_port, DEFAULT_HUB_PORT);
        assert_eq!(config.event_buffer_size, DEFAULT_EVENT_BUFFER_SIZE);
        assert!(!config.secure);
        assert_eq!(config.tls, TlsPolicy::AcceptInvalidCerts);
    }

    #[test]
    fn hub_overrides_and_bad_values() {
        let lookup = lookup_from(&[
            ("SMARTTHINGS_HUB_IP", "hub.local"),
            ("SMARTTHINGS_HUB_TOKEN", "tok"),
            ("SMARTTHINGS_HUB_PORT", "not-a-port"),
            ("SMARTTHINGS_HUB_SECURE", "TRUE"),
            ("SMARTTHINGS_EVENT_BUFFER_SIZE", "512"),
        ]);
        let Ok(config) = HubLocalConfig::from_lookup(lookup) else {
            panic!("config should load");
        };
        assert_eq!(config.hub_port, DEFAULT_HUB_PORT);
        assert!(config.secure);
        assert_eq!(config.event_buffer_size, 512);
    }

    #[test]
    fn hub_requires_ip_and_token() {
        let missing_token = lookup_from(&[("SMARTTHINGS_HUB_IP", "192.168.1.10")]);
        assert!(matches!(
            HubLocalConfig::from_lookup(missing_token),
            Err(LocalError::InvalidConfig(_))
        ));
        assert!(HubLocalConfig::new("  ", "tok").validate().is_err());
        assert!(HubLocalConfig::new("10.0.0.2", "").validate().is_err());
    }

    #[test]
    fn tv_secure_follows_port() {
        let tv = TvLocalConfig::new("10.0.0.3");
        assert_eq!(tv.port, TV_SECURE_PORT);
        assert!(tv.is_secure());

        let plain = TvLocalConfig::new("10.0.0.3").with_port(TV_PLAIN_PORT);
        assert!(!plain.is_secure());

        let forced = TvLocalConfig::new("10.0.0.3")
            .with_port(TV_PLAIN_PORT)
            .with_secure(true);
        assert!(forced.is_secure());
    }

    #[test]
    fn tv_from_lookup() {
        let lookup = lookup_from(&[
            ("SMARTTHINGS_TV_IP", "10.0.0.3"),
            ("SMARTTHINGS_TV_PORT", "8001"),
            ("SMARTTHINGS_TV_TOKEN", "12345678"),
            ("SMARTTHINGS_TV_KEEPALIVE_SECS", "0"),
        ]);
        let Ok(config) = TvLocalConfig::from_lookup(lookup) else {
            panic!("config should load");
        };
        assert_eq!(config.port, 8001);
        assert!(!config.is_secure());
        assert_eq!(config.token.as_deref(), Some("12345678"));
        assert_eq!(config.app_name, DEFAULT_TV_APP_NAME);
        assert_eq!(config.keepalive_interval, None);
    }

    #[test]
    fn tv_requires_ip() {
        assert!(matches!(
            TvLocalConfig::from_lookup(lookup_from(&[])),
            Err(LocalError::InvalidConfig(_))
        ));
    }

    #[test]
    fn tv_debug_redacts_token() {
        let config = TvLocalConfig::new("10.0.0.3").with_token("super-secret");
        let debug = format!("{config:?}");
        assert!(!debug.contains("super-secret"));
        assert!(debug.contains("<redacted>"));
    }
}
