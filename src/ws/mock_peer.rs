//! Loopback WebSocket peer for session tests.
//!
//! Answers (or rejects) the upgrade over a real `TcpListener` and speaks raw
//! frames through the codec, unmasked as a server would.

#![allow(clippy::panic)]

use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

use super::connection::Endpoint;
use super::frame::{self, DEFAULT_MAX_PAYLOAD_LEN, Frame, OpCode};
use super::handshake::accept_key;

/// How long a test waits for an expected frame.
const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Listening side of a test connection.
#[derive(Debug)]
pub(crate) struct MockPeer {
    listener: TcpListener,
}

/// One accepted, upgraded socket.
#[derive(Debug)]
pub(crate) struct PeerSocket {
    stream: BufReader<TcpStream>,
    /// Raw request head sent by the client.
    pub(crate) request: String,
}

impl MockPeer {
    pub(crate) async fn bind() -> Self {
        let Ok(listener) = TcpListener::bind("127.0.0.1:0").await else {
            panic!("mock peer bind failed");
        };
        Self { listener }
    }

    pub(crate) fn port(&self) -> u16 {
        let Ok(addr) = self.listener.local_addr() else {
            panic!("mock peer has no local addr");
        };
        addr.port()
    }

    pub(crate) fn endpoint(&self, path: &str) -> Endpoint {
        Endpoint::new("127.0.0.1", self.port(), path)
    }

    /// Accepts one connection and returns it with the request head read.
    async fn accept_raw(&self) -> (BufReader<TcpStream>, String) {
        let Ok((stream, _)) = self.listener.accept().await else {
            panic!("mock peer accept failed");
        };
        let mut stream = BufReader::new(stream);
        let mut request = String::new();
        loop {
            let mut line = String::new();
            let Ok(n) = stream.read_line(&mut line).await else {
                panic!("mock peer failed reading request");
            };
            request.push_str(&line);
            if n == 0 || line == "\r\n" {
                break;
            }
        }
        (stream, request)
    }

    /// Accepts one connection and completes the upgrade.
    pub(crate) async fn accept(&self) -> PeerSocket {
        let (mut stream, request) = self.accept_raw().await;
        let key = request
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                name.eq_ignore_ascii_case("sec-websocket-key")
                    .then(|| value.trim().to_string())
            })
            .unwrap_or_default();
        let reply = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        );
        if stream.get_mut().write_all(reply.as_bytes()).await.is_err() {
            panic!("mock peer failed writing upgrade response");
        }
        PeerSocket { stream, request }
    }

    /// Accepts one connection and answers with a non-101 status.
    pub(crate) async fn reject(&self, status: u16, body: &str) {
        let (mut stream, _) = self.accept_raw().await;
        let reply = format!(
            "HTTP/1.1 {status} Rejected\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.get_mut().write_all(reply.as_bytes()).await;
    }
}

impl PeerSocket {
    pub(crate) async fn send(&mut self, opcode: OpCode, payload: &[u8]) {
        self.send_raw(&frame::encode(opcode, payload, false)).await;
    }

    pub(crate) async fn send_json(&mut self, value: &Value) {
        self.send(OpCode::Text, value.to_string().as_bytes()).await;
    }

    pub(crate) async fn send_raw(&mut self, bytes: &[u8]) {
        if self.stream.get_mut().write_all(bytes).await.is_err() {
            panic!("mock peer write failed");
        }
    }

    /// Waits up to `wait` for the next frame; `None` on timeout or EOF.
    pub(crate) async fn recv_within(&mut self, wait: Duration) -> Option<Frame> {
        match tokio::time::timeout(wait, frame::decode(&mut self.stream, DEFAULT_MAX_PAYLOAD_LEN))
            .await
        {
            Ok(Ok(frame)) => Some(frame),
            _ => None,
        }
    }

    /// Returns the next frame, panicking if none arrives.
    pub(crate) async fn recv(&mut self) -> Frame {
        let Some(frame) = self.recv_within(RECV_TIMEOUT).await else {
            panic!("mock peer expected a frame");
        };
        frame
    }

    /// Returns the next text frame parsed as JSON, skipping control frames.
    pub(crate) async fn recv_json(&mut self) -> Value {
        loop {
            let frame = self.recv().await;
            if frame.opcode != OpCode::Text {
                continue;
            }
            let Ok(value) = serde_json::from_slice(&frame.payload) else {
                panic!("mock peer received non-JSON text frame");
            };
            return value;
        }
    }
}
