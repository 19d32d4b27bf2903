//! Connection session: one live WebSocket stream and its two background loops.
//!
//! A [`Connection`] is either disconnected or owns exactly one live stream.
//! While connected it runs:
//!
//! - a **read loop** that decodes frames, publishes JSON messages on the
//!   inbound queue, answers pings and records pongs;
//! - an optional **keepalive loop** that pings on a fixed interval and
//!   force-closes the session when no pong arrives within the timeout.
//!
//! The loops share only the frame writer (a single serialized send path) and
//! an atomic last-pong timestamp.
//!
//! ```text
//!            connect ok
//! Disconnected ─────────► Connected
//!      ▲                      │
//!      └──────────────────────┘
//!   close | read error | keepalive timeout | peer close
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, BufReader, ReadHalf, WriteHalf};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::frame::{self, DEFAULT_MAX_PAYLOAD_LEN, FrameError, OpCode};
use super::handshake::{self, HandshakeRequest};
use super::queue::{self, InboundQueue};
use super::tls::{self, BoxedTransport, TlsPolicy};
use crate::error::LocalError;

/// Stream type after the upgrade: buffered so no frame bytes are lost.
type WsStream = BufReader<BoxedTransport>;

/// Default bound on dial plus handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the inbound message queue.
pub const DEFAULT_MESSAGE_BUFFER: usize = 100;

/// Default capacity of the inbound error queue.
pub const DEFAULT_ERROR_BUFFER: usize = 16;

/// How long teardown waits on the close frame and on each loop.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Status code carried by client close frames.
const CLOSE_NORMAL: u16 = 1000;

/// Where and how to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Host name or IP address.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Default request target (path plus query).
    pub path: String,
    /// Use TLS (`wss`).
    pub secure: bool,
    /// Certificate trust policy when `secure` is set.
    pub tls: TlsPolicy,
    /// Extra headers sent with the upgrade request.
    pub headers: Vec<(String, String)>,
}

impl Endpoint {
    /// Creates a plain (`ws`) endpoint.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            path: path.into(),
            secure: false,
            tls: TlsPolicy::default(),
            headers: Vec::new(),
        }
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

    /// Adds an upgrade request header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Returns the URL without its query string, safe to log.
    #[must_use]
    pub fn display_url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        let path = self.path.split('?').next().unwrap_or_default();
        format!("{scheme}://{}:{}{path}", self.host, self.port)
    }

    fn request(&self, path: &str) -> HandshakeRequest {
        HandshakeRequest {
            host: format!("{}:{}", self.host, self.port),
            path: path.to_string(),
            headers: self.headers.clone(),
        }
    }
}

/// Keepalive settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    /// Time between pings.
    pub interval: Duration,
    /// Silence after which the peer is considered dead.
    pub timeout: Duration,
}

impl KeepaliveConfig {
    /// Pings every `interval`; times out after three intervals without a pong.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            timeout: interval.saturating_mul(3),
        }
    }

    /// Overrides the timeout window.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Engine-level settings for one [`Connection`].
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Target endpoint.
    pub endpoint: Endpoint,
    /// Client-initiated pings; `None` only answers server pings.
    pub keepalive: Option<KeepaliveConfig>,
    /// Capacity of the inbound message queue.
    pub message_buffer: usize,
    /// Capacity of the inbound error queue.
    pub error_buffer: usize,
    /// Largest accepted frame payload (and reassembled message).
    pub max_payload_len: usize,
    /// Bound on dial plus handshake.
    pub connect_timeout: Duration,
}

impl ConnectionConfig {
    /// Creates a config with default buffers and no keepalive.
    #[must_use]
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            keepalive: None,
            message_buffer: DEFAULT_MESSAGE_BUFFER,
            error_buffer: DEFAULT_ERROR_BUFFER,
            max_payload_len: DEFAULT_MAX_PAYLOAD_LEN,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Enables the keepalive loop.
    #[must_use]
    pub fn with_keepalive(mut self, keepalive: KeepaliveConfig) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Sets the inbound message queue capacity.
    #[must_use]
    pub fn with_message_buffer(mut self, capacity: usize) -> Self {
        self.message_buffer = capacity;
        self
    }

    /// Sets the dial plus handshake timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

/// Consumer halves of a connection's inbound queues.
#[derive(Debug)]
pub struct Inbound {
    /// Decoded JSON messages from text and binary frames.
    pub messages: mpsc::Receiver<Value>,
    /// Fatal session errors and non-fatal decode errors.
    pub errors: mpsc::Receiver<LocalError>,
}

/// The single serialized send path of a live stream.
struct FrameWriter {
    half: Mutex<WriteHalf<WsStream>>,
}

impl FrameWriter {
    /// Masks and writes one frame; concurrent callers queue on the lock.
    async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), LocalError> {
        let bytes = frame::encode(opcode, payload, true);
        let mut half = self.half.lock().await;
        half.write_all(&bytes).await?;
        half.flush().await?;
        Ok(())
    }

    /// Best-effort close frame followed by a write shutdown.
    async fn close(&self) {
        let bytes = frame::encode(OpCode::Close, &CLOSE_NORMAL.to_be_bytes(), true);
        let mut half = self.half.lock().await;
        let _ = half.write_all(&bytes).await;
        let _ = half.flush().await;
        let _ = half.shutdown().await;
    }
}

/// A live stream and the handles of its loops.
struct Live {
    generation: u64,
    writer: Arc<FrameWriter>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Live {
    /// Signals both loops and sends a close frame. Does not join the loops.
    async fn stop(&self) {
        self.shutdown.cancel();
        let _ = tokio::time::timeout(CLOSE_GRACE, self.writer.close()).await;
    }
}

/// State shared between the [`Connection`] handle and its loops.
struct Shared {
    id: Uuid,
    live: Mutex<Option<Live>>,
    generation: AtomicU64,
    /// Set while a dial and handshake are in flight.
    connecting: AtomicBool,
    /// Bumped by every `close`; a connect that sees it change gives up.
    closes: AtomicU64,
    messages: InboundQueue<Value>,
    errors: InboundQueue<LocalError>,
}

/// Holds the `connecting` flag for the duration of one connect attempt.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl Shared {
    /// Takes the live stream out if it still belongs to `generation`.
    async fn release(&self, generation: u64) -> Option<Live> {
        let mut slot = self.live.lock().await;
        if slot.as_ref().is_some_and(|l| l.generation == generation) {
            slot.take()
        } else {
            None
        }
    }

    /// Tears down `generation` from one of its own loops, reporting `error`.
    ///
    /// The session is disconnected before the error becomes visible.
    async fn fail(&self, generation: u64, error: Option<LocalError>) {
        let live = self.release(generation).await;
        if let Some(error) = error {
            self.errors.publish(error);
        }
        if let Some(live) = live {
            live.stop().await;
        }
    }
}

/// Everything a loop needs; cloned once per loop.
#[derive(Clone)]
struct LoopContext {
    shared: Arc<Shared>,
    writer: Arc<FrameWriter>,
    shutdown: CancellationToken,
    generation: u64,
    started: Instant,
    last_pong_ms: Arc<AtomicU64>,
    max_payload_len: usize,
}

impl LoopContext {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.started.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn publish_message(&self, payload: &[u8]) {
        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => {
                self.shared.messages.publish(value);
            }
            Err(err) => {
                tracing::debug!(session = %self.shared.id, error = %err, "dropping non-JSON message");
                self.shared.errors.publish(LocalError::Json(err));
            }
        }
    }
}

/// Why the read loop ended.
enum ReadOutcome {
    Stopped,
    PeerClosed,
    Failed(LocalError),
}

async fn read_loop(ctx: LoopContext, mut reader: ReadHalf<WsStream>) {
    let mut partial: Option<Vec<u8>> = None;

    let outcome = loop {
        let decoded = tokio::select! {
            () = ctx.shutdown.cancelled() => break ReadOutcome::Stopped,
            decoded = frame::decode(&mut reader, ctx.max_payload_len) => decoded,
        };
        let frame = match decoded {
            Ok(frame) => frame,
            Err(err) => break ReadOutcome::Failed(err.into()),
        };
        tracing::trace!(
            session = %ctx.shared.id,
            opcode = %frame.opcode,
            len = frame.payload.len(),
            "frame received"
        );

        match frame.opcode {
            OpCode::Text | OpCode::Binary => {
                if partial.take().is_some() {
                    tracing::debug!(
                        session = %ctx.shared.id,
                        "new message before the previous one finished, discarding fragments"
                    );
                }
                if frame.fin {
                    ctx.publish_message(&frame.payload);
                } else {
                    partial = Some(frame.payload);
                }
            }
            OpCode::Continuation => {
                let Some(mut buf) = partial.take() else {
                    tracing::debug!(session = %ctx.shared.id, "continuation without a message start");
                    continue;
                };
                let total = buf.len() + frame.payload.len();
                if total > ctx.max_payload_len {
                    break ReadOutcome::Failed(
                        FrameError::PayloadTooLarge {
                            len: total as u64,
                            max: ctx.max_payload_len,
                        }
                        .into(),
                    );
                }
                buf.extend_from_slice(&frame.payload);
                if frame.fin {
                    ctx.publish_message(&buf);
                } else {
                    partial = Some(buf);
                }
            }
            OpCode::Ping => {
                if let Err(err) = ctx.writer.send(OpCode::Pong, &frame.payload).await {
                    break ReadOutcome::Failed(err);
                }
            }
            OpCode::Pong => ctx.last_pong_ms.store(ctx.elapsed_ms(), Ordering::Release),
            OpCode::Close => break ReadOutcome::PeerClosed,
            OpCode::Reserved(op) => {
                tracing::debug!(session = %ctx.shared.id, opcode = op, "ignoring reserved opcode");
            }
        }
    };

    match outcome {
        ReadOutcome::Stopped => tracing::debug!(session = %ctx.shared.id, "read loop stopped"),
        ReadOutcome::PeerClosed => {
            tracing::info!(session = %ctx.shared.id, "peer closed the connection");
            ctx.shared.fail(ctx.generation, None).await;
        }
        ReadOutcome::Failed(err) => {
            tracing::warn!(session = %ctx.shared.id, error = %err, "read loop failed");
            ctx.shared.fail(ctx.generation, Some(err)).await;
        }
    }
}

async fn keepalive_loop(ctx: LoopContext, keepalive: KeepaliveConfig) {
    let mut ticker =
        tokio::time::interval_at(Instant::now() + keepalive.interval, keepalive.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let last_pong = ctx.last_pong_ms.load(Ordering::Acquire);
        let silent = Duration::from_millis(ctx.elapsed_ms().saturating_sub(last_pong));
        if silent > keepalive.timeout {
            tracing::warn!(
                session = %ctx.shared.id,
                silent_ms = silent.as_millis() as u64,
                "keepalive timeout, closing"
            );
            let err = LocalError::KeepaliveTimeout(keepalive.timeout);
            ctx.shared.fail(ctx.generation, Some(err)).await;
            return;
        }

        if let Err(err) = ctx.writer.send(OpCode::Ping, &[]).await {
            tracing::warn!(session = %ctx.shared.id, error = %err, "keepalive ping failed");
            ctx.shared.fail(ctx.generation, Some(err)).await;
            return;
        }
    }
}

/// One client WebSocket session.
///
/// Each `Connection` is independent: it owns at most one live stream and
/// nothing is shared across instances. Dropping a connected `Connection`
/// stops its loops without a close handshake; call [`Connection::close`]
/// for an orderly shutdown.
pub struct Connection {
    config: ConnectionConfig,
    shared: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("endpoint", &self.config.endpoint.display_url())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a disconnected session and the receivers of its inbound queues.
    #[must_use]
    pub fn new(config: ConnectionConfig) -> (Self, Inbound) {
        let (messages, messages_rx) = queue::channel(config.message_buffer);
        let (errors, errors_rx) = queue::channel(config.error_buffer);
        let shared = Arc::new(Shared {
            id: Uuid::new_v4(),
            live: Mutex::new(None),
            generation: AtomicU64::new(0),
            connecting: AtomicBool::new(false),
            closes: AtomicU64::new(0),
            messages,
            errors,
        });
        let inbound = Inbound {
            messages: messages_rx,
            errors: errors_rx,
        };
        (Self { config, shared }, inbound)
    }

    /// Session identifier used in log fields.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Returns the config this session was built with.
    #[must_use]
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Number of inbound messages discarded because the queue was full.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.shared.messages.dropped()
    }

    /// Connects to the endpoint's default path.
    ///
    /// # Errors
    ///
    /// See [`Connection::connect_with_path`].
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<(), LocalError> {
        let path = self.config.endpoint.path.clone();
        self.connect_with_path(&path, cancel).await
    }

    /// Dials, upgrades `path`, and starts the background loops.
    ///
    /// Returns once the handshake succeeds. `cancel` is only observed while
    /// dialing and handshaking.
    ///
    /// # Errors
    ///
    /// - [`LocalError::AlreadyConnected`] if a live stream exists or another
    ///   connect is in flight; the existing stream is left untouched.
    /// - [`LocalError::Cancelled`] if `cancel` fires first, or if
    ///   [`Connection::close`] is called before the handshake completes.
    /// - [`LocalError::ConnectTimeout`] if the configured timeout elapses.
    /// - Any dial or handshake error; the session stays disconnected.
    pub async fn connect_with_path(
        &self,
        path: &str,
        cancel: &CancellationToken,
    ) -> Result<(), LocalError> {
        let Some(_connecting) = ConnectingGuard::acquire(&self.shared.connecting) else {
            return Err(LocalError::AlreadyConnected);
        };
        if self.shared.live.lock().await.is_some() {
            return Err(LocalError::AlreadyConnected);
        }
        let closes = self.shared.closes.load(Ordering::Acquire);

        let endpoint = &self.config.endpoint;
        let request = endpoint.request(path);
        let limit = self.config.connect_timeout;
        let establish = async {
            let transport = tls::dial(&endpoint.host, endpoint.port, endpoint.secure, endpoint.tls)
                .await?;
            handshake::client_handshake(transport, &request).await
        };

        let stream = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(LocalError::Cancelled),
            result = tokio::time::timeout(limit, establish) => match result {
                Ok(stream) => stream?,
                Err(_) => return Err(LocalError::ConnectTimeout(limit)),
            },
        };

        let mut slot = self.shared.live.lock().await;
        if slot.is_some() {
            return Err(LocalError::AlreadyConnected);
        }
        if self.shared.closes.load(Ordering::Acquire) != closes {
            tracing::debug!(session = %self.shared.id, "closed during handshake, dropping stream");
            return Err(LocalError::Cancelled);
        }

        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let (reader, writer) = tokio::io::split(stream);
        let writer = Arc::new(FrameWriter {
            half: Mutex::new(writer),
        });
        let shutdown = CancellationToken::new();
        let ctx = LoopContext {
            shared: Arc::clone(&self.shared),
            writer: Arc::clone(&writer),
            shutdown: shutdown.clone(),
            generation,
            started: Instant::now(),
            last_pong_ms: Arc::new(AtomicU64::new(0)),
            max_payload_len: self.config.max_payload_len,
        };

        let mut tasks = Vec::with_capacity(2);
        if let Some(keepalive) = self.config.keepalive {
            tasks.push(tokio::spawn(keepalive_loop(ctx.clone(), keepalive)));
        }
        tasks.push(tokio::spawn(read_loop(ctx, reader)));

        *slot = Some(Live {
            generation,
            writer,
            shutdown,
            tasks,
        });
        tracing::info!(
            session = %self.shared.id,
            url = %endpoint.display_url(),
            keepalive = self.config.keepalive.is_some(),
            "connected"
        );
        Ok(())
    }

    /// Returns `true` while a live stream handle exists.
    ///
    /// This does not prove the peer is responsive; only the keepalive
    /// timeout detects a silent peer.
    pub async fn is_connected(&self) -> bool {
        self.shared.live.lock().await.is_some()
    }

    async fn writer(&self) -> Result<Arc<FrameWriter>, LocalError> {
        self.shared
            .live
            .lock()
            .await
            .as_ref()
            .map(|live| Arc::clone(&live.writer))
            .ok_or(LocalError::NotConnected)
    }

    /// Sends one masked frame through the serialized send path.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::NotConnected`] when disconnected, or
    /// [`LocalError::Io`] if the write fails.
    pub async fn send(&self, opcode: OpCode, payload: &[u8]) -> Result<(), LocalError> {
        self.writer().await?.send(opcode, payload).await
    }

    /// Serializes `value` and sends it as a text frame.
    ///
    /// # Errors
    ///
    /// Returns [`LocalError::Json`] if serialization fails, otherwise as
    /// [`Connection::send`].
    pub async fn send_json<T>(&self, value: &T) -> Result<(), LocalError>
    where
        T: Serialize + ?Sized,
    {
        let text = serde_json::to_string(value)?;
        self.send(OpCode::Text, text.as_bytes()).await
    }

    /// Stops both loops, sends a close frame and releases the stream.
    ///
    /// Idempotent: closing a disconnected session succeeds and does nothing.
    /// A connect still in its handshake is abandoned and fails with
    /// [`LocalError::Cancelled`].
    ///
    /// # Errors
    ///
    /// Never fails; the `Result` keeps the signature uniform with the other
    /// session operations.
    pub async fn close(&self) -> Result<(), LocalError> {
        self.shared.closes.fetch_add(1, Ordering::AcqRel);
        let live = self.shared.live.lock().await.take();
        let Some(live) = live else {
            return Ok(());
        };

        live.stop().await;
        for mut task in live.tasks {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        tracing::info!(session = %self.shared.id, "closed");
        Ok(())
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.shared.live.try_lock()
            && let Some(live) = slot.take()
        {
            live.shutdown.cancel();
        }
    }
}
