//! TV Local Session: remote control and pairing on top of a [`Connection`].
//!
//! The first connect without a token makes the TV ask the user to allow
//! the client. On approval the TV sends `ms.channel.connect` with a token;
//! the session keeps it for later connects and hands it to the registered
//! callback so the caller can persist it.

use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::device_info::{self, TvDeviceInfo};
use super::messages::{TvCommand, TvResponse};
use crate::config::{TokenCallback, TvLocalConfig};
use crate::error::LocalError;
use crate::ws::connection::{Connection, ConnectionConfig, Endpoint, Inbound, KeepaliveConfig};
use crate::ws::queue::{self, InboundQueue};

/// Remote-control channel path, without query.
pub const TV_REMOTE_PATH: &str = "/api/v2/channels/samsung.remote.control";

/// Receivers handed to the caller by [`TvLocalSession::new`].
#[derive(Debug)]
pub struct TvEvents {
    /// Every inbound TV message.
    pub responses: mpsc::Receiver<TvResponse>,
    /// Pairing refusals (non-fatal) and connection failures (fatal).
    pub errors: mpsc::Receiver<LocalError>,
}

type SharedToken = Arc<RwLock<Option<String>>>;

/// Dispatcher state, started on first connect.
struct Pending {
    inbound: Inbound,
    responses: InboundQueue<TvResponse>,
    errors: InboundQueue<LocalError>,
    token: SharedToken,
    on_token: Option<TokenCallback>,
}

/// Client session against a TV's remote-control channel.
#[derive(Debug)]
pub struct TvLocalSession {
    config: TvLocalConfig,
    connection: Connection,
    token: SharedToken,
    pending: StdMutex<Option<Pending>>,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("on_token", &self.on_token.is_some())
            .finish_non_exhaustive()
    }
}

impl TvLocalSession {
    /// Validates `config` and builds a disconnected session.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] if the TV IP or app name is empty.
    pub fn new(config: TvLocalConfig) -> Result<(Self, TvEvents), LocalError> {
        config.validate()?;

        let endpoint = Endpoint::new(config.tv_ip.clone(), config.port, TV_REMOTE_PATH)
            .with_secure(config.is_secure())
            .with_tls_policy(config.tls);
        let mut conn_config = ConnectionConfig::new(endpoint)
            .with_message_buffer(config.response_buffer_size)
            .with_connect_timeout(config.connect_timeout);
        if let Some(interval) = config.keepalive_interval {
            conn_config = conn_config.with_keepalive(KeepaliveConfig::new(interval));
        }
        let (connection, inbound) = Connection::new(conn_config);

        let token: SharedToken = Arc::new(RwLock::new(
            config.token.clone().filter(|t| !t.is_empty()),
        ));
        let (responses, responses_rx) = queue::channel(config.response_buffer_size);
        let (errors, errors_rx) = queue::channel(config.response_buffer_size);
        let pending = Pending {
            inbound,
            responses,
            errors,
            token: Arc::clone(&token),
            on_token: config.on_token_received.clone(),
        };

        let session = Self {
            config,
            connection,
            token,
            pending: StdMutex::new(Some(pending)),
        };
        let streams = TvEvents {
            responses: responses_rx,
            errors: errors_rx,
        };
        Ok((session, streams))
    }

    /// Session identifier used in log fields.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.connection.id()
    }

    /// Returns the config this session was built with.
    #[must_use]
    pub fn config(&self) -> &TvLocalConfig {
        &self.config
    }

    /// Current pairing token: the configured one, or the last one captured.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Request target with the base64 app name and, once paired, the token.
    #[must_use]
    pub fn request_path(&self) -> String {
        let mut query = url::form_urlencoded::Serializer::new(String::new());
        query.append_pair("name", &BASE64.encode(&self.config.app_name));
        if let Some(token) = self.token() {
            query.append_pair("token", &token);
        }
        format!("{TV_REMOTE_PATH}?{}", query.finish())
    }

    /// Connects to the remote-control channel.
    ///
    /// # Errors
    ///
    /// Any [`Connection::connect_with_path`] error.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let path = self.request_path();
        self.connection.connect_with_path(&path, cancel).await?;

        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            tokio::spawn(dispatch(self.id(), pending));
        }
        Ok(())
    }

    /// Returns `true` while a live stream handle exists.
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Sends a remote key press such as `"KEY_VOLUP"`.
    ///
    /// # Errors
    ///
    /// [`LocalError::NotConnected`] or an I/O error from the send path.
    pub async fn send_key(&self, key: &str) -> Result<(), LocalError> {
        self.connection.send_json(&TvCommand::send_key(key)).await
    }

    /// Types `text` into the focused input field.
    ///
    /// # Errors
    ///
    /// As [`TvLocalSession::send_key`].
    pub async fn send_text(&self, text: &str) -> Result<(), LocalError> {
        self.connection.send_json(&TvCommand::send_text(text)).await
    }

    /// Launches an installed app.
    ///
    /// # Errors
    ///
    /// As [`TvLocalSession::send_key`].
    pub async fn launch_app(
        &self,
        app_id: &str,
        action_type: &str,
        meta_tag: &str,
    ) -> Result<(), LocalError> {
        self.connection
            .send_json(&TvCommand::launch_app(app_id, action_type, meta_tag))
            .await
    }

    /// Opens `url` in the built-in browser.
    ///
    /// # Errors
    ///
    /// As [`TvLocalSession::send_key`].
    pub async fn open_browser(&self, url: &str) -> Result<(), LocalError> {
        self.connection
            .send_json(&TvCommand::open_browser(url))
            .await
    }

    /// Fetches the device descriptor over REST with the same trust policy.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Http`] on any request or decode failure.
    pub async fn get_device_info(&self) -> Result<TvDeviceInfo, LocalError> {
        device_info::fetch(
            &self.config.tv_ip,
            self.config.port,
            self.config.is_secure(),
            self.config.tls,
        )
        .await
    }

    /// Closes the stream. Idempotent.
    ///
    /// # Errors
    ///
    /// Never fails; see [`Connection::close`].
    pub async fn close(&self) -> Result<(), LocalError> {
        self.connection.close().await
    }
}

/// Decodes inbound messages, captures tokens and forwards everything.
async fn dispatch(session: Uuid, pending: Pending) {
    let Pending {
        inbound: Inbound {
            mut messages,
            errors: mut conn_errors,
        },
        responses,
        errors,
        token,
        on_token,
    } = pending;

    loop {
        tokio::select! {
            Some(value) = messages.recv() => {
                match serde_json::from_value::<TvResponse>(value) {
                    Ok(response) => {
                        handle_response(session, &response, &token, on_token.as_ref(), &errors);
                        responses.publish(response);
                    }
                    Err(err) => {
                        errors.publish(err.into());
                    }
                }
            }
            Some(err) = conn_errors.recv() => {
                errors.publish(err);
            }
            else => break,
        }
    }
    tracing::debug!(session = %session, "tv dispatcher stopped");
}

fn handle_response(
    session: Uuid,
    response: &TvResponse,
    token: &SharedToken,
    on_token: Option<&TokenCallback>,
    errors: &InboundQueue<LocalError>,
) {
    tracing::debug!(session = %session, event = %response.event, "tv event");

    if response.is_unauthorized() {
        tracing::warn!(session = %session, "pairing refused on the TV");
        errors.publish(LocalError::Unauthorized(
            "the TV refused the pairing request".to_string(),
        ));
        return;
    }

    let Some(captured) = response.token() else {
        return;
    };
    let captured = captured.to_string();
    let changed = {
        let mut slot = token.write().unwrap_or_else(PoisonError::into_inner);
        let changed = slot.as_deref() != Some(captured.as_str());
        *slot = Some(captured.clone());
        changed
    };
    if changed {
        tracing::info!(session = %session, "pairing token received");
    }
    if let Some(callback) = on_token {
        let callback = Arc::clone(callback);
        tokio::task::spawn_blocking(move || callback(&captured));
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::ws::mock_peer::MockPeer;

    const WAIT: Duration = Duration::from_secs(5);

    fn config(peer: &MockPeer) -> TvLocalConfig {
        TvLocalConfig::new("127.0.0.1")
            .with_port(peer.port())
            .with_secure(false)
            .with_keepalive_interval(None)
    }

    fn session(config: TvLocalConfig) -> (TvLocalSession, TvEvents) {
        let Ok(pair) = TvLocalSession::new(config) else {
            panic!("valid config rejected");
        };
        pair
    }

    #[test]
    fn request_path_encodes_name_and_token() {
        let (tv, _streams) = session(TvLocalConfig::new("192.168.1.20"));
        assert_eq!(
            tv.request_path(),
            "/api/v2/channels/samsung.remote.control?name=U21hcnRUaGluZ3MgTG9jYWw%3D"
        );
        assert!(tv.config().is_secure());

        let (tv, _streams) = session(
            TvLocalConfig::new("192.168.1.20")
                .with_app_name("Test App")
                .with_token("11223344"),
        );
        assert_eq!(
            tv.request_path(),
            "/api/v2/channels/samsung.remote.control?name=VGVzdCBBcHA%3D&token=11223344"
        );
    }

    #[tokio::test]
    async fn send_key_reaches_peer() {
        let peer = MockPeer::bind().await;
        let (tv, _streams) = session(config(&peer));
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(tv.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(socket.request.starts_with(
            "GET /api/v2/channels/samsung.remote.control?name=U21hcnRUaGluZ3MgTG9jYWw%3D HTTP/1.1\r\n"
        ));

        assert!(tv.send_key("KEY_VOLUP").await.is_ok());
        assert_eq!(
            socket.recv_json().await,
            json!({
                "method": "ms.remote.control",
                "params": {"Cmd": "Click", "DataOfCmd": "KEY_VOLUP", "TypeOfRemote": "SendRemoteKey"}
            })
        );

        assert!(tv.launch_app("111299001912", "DEEP_LINK", "").await.is_ok());
        let launch = socket.recv_json().await;
        assert_eq!(launch.get("method"), Some(&json!("ms.channel.emit")));
        assert!(tv.close().await.is_ok());
    }

    #[tokio::test]
    async fn token_is_captured_and_reused() {
        let peer = MockPeer::bind().await;
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let config = config(&peer).with_token_callback(move |token| {
            let _ = tx.send(token.to_string());
        });
        let (tv, mut streams) = session(config);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(tv.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(!socket.request.contains("token="));
        assert_eq!(tv.token(), None);

        socket
            .send_json(&json!({
                "event": "ms.channel.connect",
                "data": {"id": "client-1", "token": "12345678"}
            }))
            .await;

        let Ok(Some(token)) = tokio::time::timeout(WAIT, rx.recv()).await else {
            panic!("token callback not invoked");
        };
        assert_eq!(token, "12345678");
        assert_eq!(tv.token().as_deref(), Some("12345678"));
        let Ok(Some(response)) = tokio::time::timeout(WAIT, streams.responses.recv()).await else {
            panic!("connect event not published");
        };
        assert_eq!(response.event, "ms.channel.connect");

        assert!(tv.close().await.is_ok());
        let (result, socket) = tokio::join!(tv.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(socket.request.contains("&token=12345678 HTTP/1.1\r\n"));
    }

    #[tokio::test]
    async fn unauthorized_is_non_fatal() {
        let peer = MockPeer::bind().await;
        let (tv, mut streams) = session(config(&peer));
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(tv.connect(&cancel), peer.accept());
        assert!(result.is_ok());

        socket.send_json(&json!({"event": "ms.channel.unauthorized"})).await;
        let Ok(Some(err)) = tokio::time::timeout(WAIT, streams.errors.recv()).await else {
            panic!("no unauthorized error");
        };
        assert!(matches!(err, LocalError::Unauthorized(_)));
        assert!(tv.is_connected().await);
        assert_eq!(tv.token(), None);
    }

    #[tokio::test]
    async fn commands_need_a_live_stream() {
        let peer = MockPeer::bind().await;
        let (tv, _streams) = session(config(&peer));
        assert!(matches!(
            tv.send_text("hello").await,
            Err(LocalError::NotConnected)
        ));
        assert!(matches!(
            tv.open_browser("https://example.com").await,
            Err(LocalError::NotConnected)
        ));
    }
}
