//! Client side of the HTTP/1.1 Upgrade exchange (RFC 6455 §4.1).
//!
//! [`client_handshake`] writes the upgrade request, validates the `101`
//! response and its `Sec-WebSocket-Accept` header, and hands back the stream
//! wrapped in a [`BufReader`] so that frame bytes the peer sent right after
//! the response headers stay buffered rather than being lost.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};

use crate::error::LocalError;

/// GUID appended to the key before hashing.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Protocol version sent in `Sec-WebSocket-Version`.
pub const WEBSOCKET_VERSION: &str = "13";

/// Upper bound on the response head, status line included.
const MAX_HEAD_LEN: usize = 16 * 1024;

/// Upper bound on the body read from a rejected upgrade.
const MAX_BODY_LEN: usize = 4 * 1024;

/// What to ask the peer for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Value of the `Host` header, usually `host:port`.
    pub host: String,
    /// Request target: path plus any query string.
    pub path: String,
    /// Extra headers, e.g. `Authorization`.
    pub headers: Vec<(String, String)>,
}

/// Generates a fresh `Sec-WebSocket-Key`: 16 random bytes, base64-encoded.
#[must_use]
pub fn generate_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Computes the `Sec-WebSocket-Accept` value the peer must return for `key`.
#[must_use]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Renders the upgrade request for `key`.
fn render_request(request: &HandshakeRequest, key: &str) -> String {
    let mut out = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: {WEBSOCKET_VERSION}\r\n",
        path = request.path,
        host = request.host,
    );
    for (name, value) in &request.headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    out
}

/// Parsed status line and headers of the upgrade response.
#[derive(Debug)]
struct ResponseHead {
    status: u16,
    headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Case-insensitive header lookup.
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Reads the status line and headers, up to and including the blank line.
async fn read_head<S>(reader: &mut BufReader<S>) -> Result<ResponseHead, LocalError>
where
    S: AsyncRead + Unpin,
{
    let mut consumed = 0usize;
    let mut line = String::new();

    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(LocalError::MalformedResponse(
            "connection closed before response".to_string(),
        ));
    }
    consumed += n;

    let mut parts = line.trim_end().splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/1.") {
        return Err(LocalError::MalformedResponse(format!(
            "unexpected status line {:?}",
            line.trim_end()
        )));
    }
    let status = parts
        .next()
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| {
            LocalError::MalformedResponse(format!("bad status line {:?}", line.trim_end()))
        })?;

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(LocalError::MalformedResponse(
                "connection closed inside response headers".to_string(),
            ));
        }
        consumed += n;
        if consumed > MAX_HEAD_LEN {
            return Err(LocalError::MalformedResponse(
                "response headers too large".to_string(),
            ));
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(ResponseHead { status, headers })
}

/// Reads a bounded diagnostic body from a rejected upgrade.
async fn read_body<S>(reader: &mut BufReader<S>, head: &ResponseHead) -> String
where
    S: AsyncRead + Unpin,
{
    let Some(len) = head
        .header("Content-Length")
        .and_then(|v| v.parse::<usize>().ok())
    else {
        return String::new();
    };
    let mut body = vec![0u8; len.min(MAX_BODY_LEN)];
    match reader.read_exact(&mut body).await {
        Ok(_) => String::from_utf8_lossy(&body).into_owned(),
        Err(_) => String::new(),
    }
}

/// Performs the upgrade over an already-dialed stream.
///
/// Returns the stream positioned immediately after the response headers.
///
/// # Errors
///
/// - [`LocalError::Io`] if writing the request or reading the response fails.
/// - [`LocalError::MalformedResponse`] if the response is not HTTP/1.x.
/// - [`LocalError::Handshake`] if the status is not 101 (status and body
///   are carried for diagnostics).
/// - [`LocalError::AcceptMismatch`] if `Sec-WebSocket-Accept` is missing or
///   differs from [`accept_key`] of the request key.
pub async fn client_handshake<S>(
    mut stream: S,
    request: &HandshakeRequest,
) -> Result<BufReader<S>, LocalError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let key = generate_key();
    stream
        .write_all(render_request(request, &key).as_bytes())
        .await?;
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let head = read_head(&mut reader).await?;

    if head.status != 101 {
        let body = read_body(&mut reader, &head).await;
        return Err(LocalError::Handshake {
            status: head.status,
            body,
        });
    }

    let expected = accept_key(&key);
    let actual = head.header("Sec-WebSocket-Accept").unwrap_or_default();
    if actual != expected {
        return Err(LocalError::AcceptMismatch {
            expected,
            actual: actual.to_string(),
        });
    }

    tracing::debug!(host = %request.host, path = %request.path, "websocket upgrade accepted");
    Ok(reader)
}
