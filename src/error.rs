//! Error types shared by the protocol engine and the device sessions.
//!
//! [`LocalError`] is the central error type of the crate. Each variant is
//! classified as fatal (the session is torn down) or non-fatal (surfaced to
//! the caller while the connection stays open), see [`LocalError::is_fatal`].

use std::time::Duration;

use crate::ws::frame::FrameError;

/// Crate-wide error enum.
///
/// # Classification
///
/// | Kind               | Raised by                       | Fatal |
/// |--------------------|---------------------------------|-------|
/// | `invalid_config`   | config validation               | no    |
/// | `invalid_argument` | empty subscribe list            | no    |
/// | `already_connected`| `connect` on a live session     | no    |
/// | `handshake`        | non-101 upgrade response        | yes   |
/// | `frame` / `io`     | read loop, send path            | yes   |
/// | `keepalive_timeout`| keepalive loop                  | yes   |
/// | `hub`              | hub `{"messageType":"error"}`   | no    |
/// | `unauthorized`     | TV pairing refused              | no    |
#[derive(Debug, thiserror::Error)]
pub enum LocalError {
    /// Configuration rejected before any I/O.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// A caller-supplied argument was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `connect` was called while a live stream exists.
    #[error("already connected")]
    AlreadyConnected,

    /// An operation needing a live stream was called while disconnected.
    #[error("not connected")]
    NotConnected,

    /// The caller's cancellation signal fired during dial or handshake.
    #[error("connect cancelled")]
    Cancelled,

    /// Dial plus handshake did not finish within the configured window.
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS client setup failed.
    #[error("tls error: {0}")]
    Tls(String),

    /// The peer answered the upgrade request with a status other than 101.
    #[error("handshake rejected with status {status}: {body}")]
    Handshake {
        /// HTTP status code returned by the peer.
        status: u16,
        /// Response body, truncated, for diagnostics.
        body: String,
    },

    /// The `Sec-WebSocket-Accept` header did not match the request key.
    #[error("handshake accept mismatch: expected {expected}, got {actual}")]
    AcceptMismatch {
        /// Value derived from the request key.
        expected: String,
        /// Value sent by the peer (empty when the header was absent).
        actual: String,
    },

    /// The upgrade response could not be parsed as HTTP/1.1.
    #[error("malformed handshake response: {0}")]
    MalformedResponse(String),

    /// A frame could not be decoded.
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    /// No pong arrived within the keepalive window.
    #[error("no pong received within {0:?}")]
    KeepaliveTimeout(Duration),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The hub reported an application-level error.
    #[error("hub error {code}: {message}")]
    Hub {
        /// Hub-defined error code.
        code: String,
        /// Human-readable message.
        message: String,
    },

    /// The TV refused the pairing request.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// HTTP request outside the WebSocket engine failed.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
}

impl LocalError {
    /// Returns a stable snake_case label for this variant, used as a log field.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::InvalidConfig(_) => "invalid_config",
            Self::InvalidArgument(_) => "invalid_argument",
            Self::AlreadyConnected => "already_connected",
            Self::NotConnected => "not_connected",
            Self::Cancelled => "cancelled",
            Self::ConnectTimeout(_) => "connect_timeout",
            Self::Io(_) => "io",
            Self::Tls(_) => "tls",
            Self::Handshake { .. } => "handshake",
            Self::AcceptMismatch { .. } => "accept_mismatch",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Frame(_) => "frame",
            Self::KeepaliveTimeout(_) => "keepalive_timeout",
            Self::Json(_) => "json",
            Self::Hub { .. } => "hub",
            Self::Unauthorized(_) => "unauthorized",
            Self::Http(_) => "http",
        }
    }

    /// Returns `true` if this error ends the session it was raised on.
    ///
    /// Application-level errors and input validation failures leave the
    /// connection untouched.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::InvalidConfig(_)
            | Self::InvalidArgument(_)
            | Self::AlreadyConnected
            | Self::NotConnected
            | Self::Json(_)
            | Self::Hub { .. }
            | Self::Unauthorized(_)
            | Self::Http(_) => false,
            Self::Cancelled
            | Self::ConnectTimeout(_)
            | Self::Io(_)
            | Self::Tls(_)
            | Self::Handshake { .. }
            | Self::AcceptMismatch { .. }
            | Self::MalformedResponse(_)
            | Self::Frame(_)
            | Self::KeepaliveTimeout(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn application_errors_are_not_fatal() {
        let err = LocalError::Hub {
            code: "400".to_string(),
            message: "bad device".to_string(),
        };
        assert!(!err.is_fatal());
        assert_eq!(err.kind(), "hub");
        assert_eq!(err.to_string(), "hub error 400: bad device");
    }

    #[test]
    fn keepalive_timeout_is_fatal() {
        let err = LocalError::KeepaliveTimeout(Duration::from_secs(90));
        assert!(err.is_fatal());
        assert_eq!(err.kind(), "keepalive_timeout");
    }

    #[test]
    fn handshake_error_carries_status_and_body() {
        let err = LocalError::Handshake {
            status: 403,
            body: "forbidden".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "handshake rejected with status 403: forbidden"
        );
    }
}
