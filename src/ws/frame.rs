//! WebSocket frame codec (RFC 6455 §5.2).
//!
//! Pure functions: [`encode`] builds the wire bytes of a single frame and
//! [`decode`] reads exactly one frame from any [`AsyncRead`] source, plain
//! or TLS. Neither function holds state between calls.
//!
//! ```text
//!  0               1               2               3
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |          (16/64)              |
//! |N|V|V|V|       |S|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Masking-key, if MASK set   |          Payload Data          |
//! +--------------------------------+ - - - - - - - - - - - - - - - +
//! ```

use std::fmt;

use tokio::io::{AsyncRead, AsyncReadExt};

/// FIN bit of the first header byte.
const FIN: u8 = 0x80;

/// MASK bit of the second header byte.
const MASK: u8 = 0x80;

/// Largest payload length expressible in the 7-bit field.
const MAX_SHORT_LEN: usize = 125;

/// Marker for the 16-bit extended length form.
const LEN_16: u8 = 126;

/// Marker for the 64-bit extended length form.
const LEN_64: u8 = 127;

/// Default upper bound on a single decoded payload (16 MiB).
pub const DEFAULT_MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Frame-type discriminant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    /// Continuation of a fragmented message.
    Continuation,
    /// UTF-8 text data.
    Text,
    /// Binary data.
    Binary,
    /// Connection close.
    Close,
    /// Ping.
    Ping,
    /// Pong.
    Pong,
    /// Any reserved opcode (0x3-0x7, 0xB-0xF), passed through unchanged.
    Reserved(u8),
}

impl OpCode {
    /// Parses the low nibble of a header byte.
    #[must_use]
    pub const fn from_u8(byte: u8) -> Self {
        match byte & 0x0F {
            0x0 => Self::Continuation,
            0x1 => Self::Text,
            0x2 => Self::Binary,
            0x8 => Self::Close,
            0x9 => Self::Ping,
            0xA => Self::Pong,
            other => Self::Reserved(other),
        }
    }

    /// Returns the 4-bit wire value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Continuation => 0x0,
            Self::Text => 0x1,
            Self::Binary => 0x2,
            Self::Close => 0x8,
            Self::Ping => 0x9,
            Self::Pong => 0xA,
            Self::Reserved(op) => op & 0x0F,
        }
    }

    /// Returns `true` for close, ping and pong.
    #[must_use]
    pub const fn is_control(self) -> bool {
        self.as_u8() & 0x08 != 0
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Continuation => f.write_str("continuation"),
            Self::Text => f.write_str("text"),
            Self::Binary => f.write_str("binary"),
            Self::Close => f.write_str("close"),
            Self::Ping => f.write_str("ping"),
            Self::Pong => f.write_str("pong"),
            Self::Reserved(op) => write!(f, "reserved(0x{op:x})"),
        }
    }
}

/// One decoded WebSocket frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Final fragment of a message.
    pub fin: bool,
    /// Frame type.
    pub opcode: OpCode,
    /// Whether the sender masked the payload.
    pub masked: bool,
    /// Masking key, present iff `masked`.
    pub mask_key: Option<[u8; 4]>,
    /// Payload, already unmasked.
    pub payload: Vec<u8>,
}

/// Frame decoding failures.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream ended or failed mid-frame.
    #[error("read failed: {0}")]
    Io(#[from] std::io::Error),

    /// The declared payload exceeds the configured maximum.
    #[error("payload of {len} bytes exceeds limit of {max}")]
    PayloadTooLarge {
        /// Declared length.
        len: u64,
        /// Configured maximum.
        max: usize,
    },

    /// A 64-bit length with the most significant bit set.
    #[error("invalid 64-bit payload length {0:#x}")]
    InvalidLength(u64),
}

/// XORs `buf` in place with the 4-byte `key`, cycling from offset 0.
///
/// Masking and unmasking are the same operation.
pub fn apply_mask(buf: &mut [u8], key: [u8; 4]) {
    for (byte, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *byte ^= k;
    }
}

/// Encodes a single final frame.
///
/// When `mask` is set a fresh random key is drawn for this frame; every
/// client-originated frame must pass `true`.
#[must_use]
pub fn encode(opcode: OpCode, payload: &[u8], mask: bool) -> Vec<u8> {
    let key = mask.then(rand::random::<[u8; 4]>);
    encode_with_key(opcode, payload, key)
}

/// Encodes a single final frame with an explicit masking key.
///
/// `None` produces an unmasked frame (server role, tests).
#[must_use]
pub fn encode_with_key(opcode: OpCode, payload: &[u8], key: Option<[u8; 4]>) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(FIN | opcode.as_u8());

    let mask_bit = if key.is_some() { MASK } else { 0 };
    let len = payload.len();
    if len <= MAX_SHORT_LEN {
        // Fits in 7 bits.
        out.push(mask_bit | len as u8);
    } else if let Ok(len16) = u16::try_from(len) {
        out.push(mask_bit | LEN_16);
        out.extend_from_slice(&len16.to_be_bytes());
    } else {
        out.push(mask_bit | LEN_64);
        out.extend_from_slice(&(len as u64).to_be_bytes());
    }

    match key {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            if let Some(body) = out.get_mut(start..) {
                apply_mask(body, key);
            }
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Reads exactly one frame from `reader`.
///
/// The payload is unmasked when the mask bit is set. Reserved opcodes are
/// returned as [`OpCode::Reserved`] for the caller to reject or ignore.
/// No buffer larger than the declared length is allocated, and lengths
/// above `max_payload_len` are rejected before allocating.
///
/// # Errors
///
/// Returns [`FrameError::Io`] on a truncated or failed read,
/// [`FrameError::PayloadTooLarge`] when the declared length exceeds
/// `max_payload_len`, and [`FrameError::InvalidLength`] for a 64-bit length
/// with its most significant bit set.
pub async fn decode<R>(reader: &mut R, max_payload_len: usize) -> Result<Frame, FrameError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut head = [0u8; 2];
    reader.read_exact(&mut head).await?;
    let [b0, b1] = head;

    let fin = b0 & FIN != 0;
    let opcode = OpCode::from_u8(b0);
    let masked = b1 & MASK != 0;

    let len = match b1 & 0x7F {
        LEN_16 => u64::from(reader.read_u16().await?),
        LEN_64 => {
            // All eight bytes contribute to the length.
            let len = reader.read_u64().await?;
            if len & (1 << 63) != 0 {
                return Err(FrameError::InvalidLength(len));
            }
            len
        }
        short => u64::from(short),
    };

    let len = match usize::try_from(len) {
        Ok(len) if len <= max_payload_len => len,
        _ => {
            return Err(FrameError::PayloadTooLarge {
                len,
                max: max_payload_len,
            });
        }
    };

    let mask_key = if masked {
        let mut key = [0u8; 4];
        reader.read_exact(&mut key).await?;
        Some(key)
    } else {
        None
    };

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    if let Some(key) = mask_key {
        apply_mask(&mut payload, key);
    }

    Ok(Frame {
        fin,
        opcode,
        masked,
        mask_key,
        payload,
    })
}
