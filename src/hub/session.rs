//! Hub Local Session: subscription control and device-event decoding on top
//! of a [`Connection`].
//!
//! The hub pings the client on its own schedule, so no keepalive loop runs;
//! the read loop answers those pings.

use std::sync::{Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::messages::{HubCommand, HubLocalEvent, HubLocalMessage};
use super::subscription::SubscriptionManager;
use crate::config::HubLocalConfig;
use crate::error::LocalError;
use crate::ws::connection::{Connection, ConnectionConfig, Endpoint, Inbound};
use crate::ws::queue::{self, InboundQueue};

/// Request target of the hub's local event stream.
pub const HUB_EVENTS_PATH: &str = "/api/v1/local/events";

/// Receivers handed to the caller by [`HubLocalSession::new`].
#[derive(Debug)]
pub struct HubEvents {
    /// Decoded device events.
    pub events: mpsc::Receiver<HubLocalEvent>,
    /// Hub error messages (non-fatal) and connection failures (fatal).
    pub errors: mpsc::Receiver<LocalError>,
}

/// Queues the dispatcher is started with on first connect.
#[derive(Debug)]
struct Pending {
    inbound: Inbound,
    events: InboundQueue<HubLocalEvent>,
    errors: InboundQueue<LocalError>,
}

/// Client session against a hub's local event stream.
#[derive(Debug)]
pub struct HubLocalSession {
    config: HubLocalConfig,
    connection: Connection,
    subscriptions: Mutex<SubscriptionManager>,
    pending: StdMutex<Option<Pending>>,
    events: InboundQueue<HubLocalEvent>,
}

impl HubLocalSession {
    /// Validates `config` and builds a disconnected session.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::InvalidConfig`] if the hub IP or token is empty.
    pub fn new(config: HubLocalConfig) -> Result<(Self, HubEvents), LocalError> {
        config.validate()?;

        let endpoint = Endpoint::new(config.hub_ip.clone(), config.hub_port, HUB_EVENTS_PATH)
            .with_secure(config.secure)
            .with_tls_policy(config.tls)
            .with_header("Authorization", format!("Bearer {}", config.token));
        let conn_config = ConnectionConfig::new(endpoint)
            .with_message_buffer(config.event_buffer_size)
            .with_connect_timeout(config.connect_timeout);
        let (connection, inbound) = Connection::new(conn_config);

        let (events, events_rx) = queue::channel(config.event_buffer_size);
        let (errors, errors_rx) = queue::channel(config.event_buffer_size);
        let pending = Pending {
            inbound,
            events: events.clone(),
            errors,
        };

        let session = Self {
            config,
            connection,
            subscriptions: Mutex::new(SubscriptionManager::new()),
            pending: StdMutex::new(Some(pending)),
            events,
        };
        let streams = HubEvents {
            events: events_rx,
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
    pub fn config(&self) -> &HubLocalConfig {
        &self.config
    }

    /// Number of device events discarded because the event queue was full.
    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped()
    }

    /// Connects and re-sends every subscription recorded so far.
    ///
    /// # Errors
    ///
    /// Any [`Connection::connect`] error, or the send error of a replayed
    /// subscription. The stream is closed again if the replay fails.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        self.connection.connect(cancel).await?;
        self.start_dispatcher();

        if let Err(err) = self.replay_subscriptions().await {
            tracing::warn!(session = %self.id(), error = %err, "subscription replay failed");
            self.connection.close().await?;
            return Err(err);
        }
        Ok(())
    }

    async fn replay_subscriptions(&self) -> Result<(), LocalError> {
        let commands = self.subscriptions.lock().await.replay_commands();
        for command in &commands {
            self.connection.send_json(command).await?;
        }
        if !commands.is_empty() {
            tracing::info!(
                session = %self.id(),
                commands = commands.len(),
                "subscriptions replayed"
            );
        }
        Ok(())
    }

    fn start_dispatcher(&self) {
        let pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(pending) = pending {
            tokio::spawn(dispatch(self.id(), pending));
        }
    }

    /// Returns `true` while a live stream handle exists.
    pub async fn is_connected(&self) -> bool {
        self.connection.is_connected().await
    }

    /// Requests events for `device_ids`.
    ///
    /// # Errors
    ///
    /// - [`LocalError::InvalidArgument`] if `device_ids` is empty; nothing is sent.
    /// - [`LocalError::NotConnected`] or an I/O error from the send path.
    pub async fn subscribe<S: AsRef<str>>(&self, device_ids: &[S]) -> Result<(), LocalError> {
        let ids = non_empty(device_ids, "subscribe")?;
        self.connection
            .send_json(&HubCommand::subscribe(ids))
            .await?;
        self.subscriptions.lock().await.subscribe(device_ids);
        Ok(())
    }

    /// Stops events for `device_ids`.
    ///
    /// # Errors
    ///
    /// As [`HubLocalSession::subscribe`].
    pub async fn unsubscribe<S: AsRef<str>>(&self, device_ids: &[S]) -> Result<(), LocalError> {
        let ids = non_empty(device_ids, "unsubscribe")?;
        self.connection
            .send_json(&HubCommand::unsubscribe(ids))
            .await?;
        self.subscriptions.lock().await.unsubscribe(device_ids);
        Ok(())
    }

    /// Requests events for every device on the hub.
    ///
    /// # Errors
    ///
    /// [`LocalError::NotConnected`] or an I/O error from the send path.
    pub async fn subscribe_all(&self) -> Result<(), LocalError> {
        self.connection
            .send_json(&HubCommand::subscribe_all())
            .await?;
        self.subscriptions.lock().await.subscribe_all();
        Ok(())
    }

    /// Snapshot of the locally tracked subscription set.
    pub async fn subscriptions(&self) -> SubscriptionManager {
        self.subscriptions.lock().await.clone()
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

fn non_empty<S: AsRef<str>>(ids: &[S], op: &str) -> Result<Vec<String>, LocalError> {
    if ids.is_empty() {
        return Err(LocalError::InvalidArgument(format!(
            "{op} requires at least one device ID"
        )));
    }
    Ok(ids.iter().map(|id| id.as_ref().to_string()).collect())
}

/// Translates raw inbound JSON into hub events until the connection is gone.
async fn dispatch(session: Uuid, pending: Pending) {
    let Pending {
        inbound: Inbound {
            mut messages,
            errors: mut conn_errors,
        },
        events,
        errors,
    } = pending;

    loop {
        tokio::select! {
            Some(value) = messages.recv() => match HubLocalMessage::from_value(value) {
                Ok(HubLocalMessage::DeviceEvent(event)) => {
                    tracing::debug!(
                        session = %session,
                        device = %event.device_id,
                        capability = %event.capability,
                        "device event"
                    );
                    events.publish(event);
                }
                Ok(HubLocalMessage::Error(payload)) => {
                    tracing::warn!(
                        session = %session,
                        code = %payload.code,
                        message = %payload.message,
                        "hub reported an error"
                    );
                    errors.publish(payload.into());
                }
                Ok(HubLocalMessage::Other(kind)) => {
                    tracing::debug!(session = %session, message_type = %kind, "ignoring hub message");
                }
                Err(err) => {
                    errors.publish(err);
                }
            },
            Some(err) = conn_errors.recv() => {
                errors.publish(err);
            }
            else => break,
        }
    }
    tracing::debug!(session = %session, "hub dispatcher stopped");
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::ws::frame::OpCode;
    use crate::ws::mock_peer::MockPeer;

    const WAIT: Duration = Duration::from_secs(5);

    fn session(peer: &MockPeer) -> (HubLocalSession, HubEvents) {
        let config = HubLocalConfig::new("127.0.0.1", "hub-token").with_port(peer.port());
        let Ok(pair) = HubLocalSession::new(config) else {
            panic!("valid config rejected");
        };
        pair
    }

    #[test]
    fn empty_token_is_rejected() {
        let config = HubLocalConfig::new("127.0.0.1", "");
        assert!(matches!(
            HubLocalSession::new(config),
            Err(LocalError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn upgrade_carries_path_and_bearer_token() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(socket.request.starts_with("GET /api/v1/local/events HTTP/1.1\r\n"));
        assert!(socket.request.contains("Authorization: Bearer hub-token\r\n"));
        assert!(hub.close().await.is_ok());
    }

    #[tokio::test]
    async fn subscribe_without_ids_sends_nothing() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());

        let none: [&str; 0] = [];
        assert!(matches!(
            hub.subscribe(&none).await,
            Err(LocalError::InvalidArgument(_))
        ));
        assert!(matches!(
            hub.unsubscribe(&none).await,
            Err(LocalError::InvalidArgument(_))
        ));
        assert!(socket.recv_within(Duration::from_millis(200)).await.is_none());
        assert!(hub.is_connected().await);
    }

    #[tokio::test]
    async fn subscribe_sends_one_frame() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());

        assert!(hub.subscribe(&["device-1", "device-2"]).await.is_ok());
        let frame = socket.recv().await;
        assert_eq!(frame.opcode, OpCode::Text);
        assert!(frame.masked);
        let Ok(body) = serde_json::from_slice::<serde_json::Value>(&frame.payload) else {
            panic!("subscribe frame is not JSON");
        };
        assert_eq!(
            body,
            json!({"messageType": "subscribe", "deviceIds": ["device-1", "device-2"]})
        );
        assert!(socket.recv_within(Duration::from_millis(200)).await.is_none());

        assert!(hub.subscribe_all().await.is_ok());
        assert_eq!(socket.recv_json().await, json!({"messageType": "subscribeAll"}));

        assert!(hub.unsubscribe(&["device-2"]).await.is_ok());
        assert_eq!(
            socket.recv_json().await,
            json!({"messageType": "unsubscribe", "deviceIds": ["device-2"]})
        );

        let subs = hub.subscriptions().await;
        assert!(subs.is_subscribed_all());
        assert_eq!(subs.device_ids().collect::<Vec<_>>(), vec!["device-1"]);
    }

    #[tokio::test]
    async fn device_event_reaches_event_stream() {
        let peer = MockPeer::bind().await;
        let (hub, mut streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());

        socket
            .send_json(&json!({
                "messageType": "deviceEvent",
                "deviceEvent": {
                    "deviceId": "device-123",
                    "component": "main",
                    "capability": "switch",
                    "attribute": "switch",
                    "value": "on",
                    "stateChange": true
                }
            }))
            .await;

        let Ok(Some(event)) = tokio::time::timeout(WAIT, streams.events.recv()).await else {
            panic!("no device event");
        };
        assert_eq!(event.device_id, "device-123");
        assert_eq!(event.capability, "switch");
        assert_eq!(event.value, json!("on"));
        assert_eq!(event.state_change, Some(true));
    }

    #[tokio::test]
    async fn hub_error_keeps_connection_open() {
        let peer = MockPeer::bind().await;
        let (hub, mut streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());

        socket
            .send_json(&json!({
                "messageType": "error",
                "error": {"code": "INVALID_DEVICE", "message": "unknown device"}
            }))
            .await;

        let Ok(Some(err)) = tokio::time::timeout(WAIT, streams.errors.recv()).await else {
            panic!("no hub error");
        };
        let LocalError::Hub { code, message } = &err else {
            panic!("unexpected error {err}");
        };
        assert_eq!(code, "INVALID_DEVICE");
        assert_eq!(message, "unknown device");
        assert!(!err.is_fatal());
        assert!(hub.is_connected().await);

        assert!(hub.subscribe(&["device-1"]).await.is_ok());
        assert_eq!(
            socket.recv_json().await,
            json!({"messageType": "subscribe", "deviceIds": ["device-1"]})
        );
    }

    #[tokio::test]
    async fn subscriptions_replay_after_reconnect() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        let cancel = CancellationToken::new();
        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(hub.subscribe(&["device-9"]).await.is_ok());
        let _ = socket.recv_json().await;
        assert!(hub.close().await.is_ok());

        let (result, mut socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert_eq!(
            socket.recv_json().await,
            json!({"messageType": "subscribe", "deviceIds": ["device-9"]})
        );
    }

    #[tokio::test]
    async fn failed_replay_leaves_session_disconnected() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        let ids: Vec<String> = (0..500_000).map(|i| format!("device-{i:07}")).collect();
        hub.subscriptions.lock().await.subscribe(&ids);

        let cancel = CancellationToken::new();
        // The peer hangs up right after the upgrade, so the large replay
        // frame cannot be written.
        let (result, ()) = tokio::join!(hub.connect(&cancel), async {
            drop(peer.accept().await);
        });
        assert!(result.is_err());
        assert!(!hub.is_connected().await);

        hub.subscriptions.lock().await.unsubscribe(&ids);
        let (result, _socket) = tokio::join!(hub.connect(&cancel), peer.accept());
        assert!(result.is_ok());
        assert!(hub.is_connected().await);
    }

    #[tokio::test]
    async fn commands_need_a_live_stream() {
        let peer = MockPeer::bind().await;
        let (hub, _streams) = session(&peer);
        assert!(matches!(
            hub.subscribe(&["device-1"]).await,
            Err(LocalError::NotConnected)
        ));
        assert!(matches!(
            hub.subscribe_all().await,
            Err(LocalError::NotConnected)
        ));
        assert_eq!(hub.subscriptions().await.count(), 0);
    }
}
