//! Binary codec for paynet wire frames.
//!
//! Wire format:
//! ```text
//! [payload_len:4][msg_type:2][payload:N]
//! ```
//! Header size: 6 bytes. All multi-byte integers are big-endian.  The length
//! field counts payload bytes only.
//!
//! The codec carries no application semantics and no retry logic: every
//! failure is returned to the caller (the session), which decides what to do.

use thiserror::Error;
use tracing::trace;

use crate::protocol::message::MessageType;

/// Size of the payload length field in bytes.
pub const LENGTH_FIELD_SIZE: usize = 4;

/// Size of the message type field in bytes.
pub const TYPE_FIELD_SIZE: usize = 2;

/// Total size of the frame header in bytes.
pub const HEADER_SIZE: usize = LENGTH_FIELD_SIZE + TYPE_FIELD_SIZE;

/// Default upper bound for a single payload (1 MiB).
pub const DEFAULT_MAX_PAYLOAD: usize = 1024 * 1024;

/// Errors that can occur during frame encoding or decoding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The byte slice does not yet contain a complete frame.
    ///
    /// Not a real failure on a streaming transport: wait for more bytes.
    #[error("insufficient data: need at least {needed} bytes, got {available}")]
    InsufficientData { needed: usize, available: usize },

    /// The length field (or the payload being encoded) exceeds the limit.
    #[error("payload of {len} bytes exceeds the {max}-byte limit")]
    PayloadTooLarge { len: usize, max: usize },
}

/// One decoded wire unit: a type identifier plus opaque payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Identifies the schema of `payload`.
    pub message_type: MessageType,
    /// Schema-encoded payload; opaque to the codec.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a frame from a type and payload.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
        }
    }

    /// Encodes this frame.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Vec<u8>, FrameError> {
        encode_frame(self.message_type, &self.payload, max_payload)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes a type and payload into a complete frame.
///
/// # Errors
///
/// Returns [`FrameError::PayloadTooLarge`] if `payload` is longer than
/// `max_payload` (or does not fit the 32-bit length field).
///
/// # Examples
///
/// ```rust
/// use paynet_core::{decode_frame, encode_frame, MessageType};
/// use paynet_core::protocol::DEFAULT_MAX_PAYLOAD;
///
/// let bytes = encode_frame(MessageType(8), b"ack", DEFAULT_MAX_PAYLOAD).unwrap();
/// let (frame, consumed) = decode_frame(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
/// assert_eq!(frame.message_type, MessageType(8));
/// assert_eq!(frame.payload, b"ack");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn encode_frame(
    message_type: MessageType,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<u8>, FrameError> {
    let max = max_payload.min(u32::MAX as usize);
    if payload.len() > max {
        return Err(FrameError::PayloadTooLarge {
            len: payload.len(),
            max,
        });
    }

    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&message_type.value().to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Decodes one frame from the beginning of `bytes`.
///
/// Returns the frame and the number of bytes consumed (header + payload), so
/// the caller can advance its read cursor.
///
/// # Errors
///
/// - [`FrameError::InsufficientData`] when `bytes` holds only part of a frame.
/// - [`FrameError::PayloadTooLarge`] when the length field exceeds
///   `max_payload`.  This is detected from the header alone, before any
///   payload bytes are buffered.
pub fn decode_frame(bytes: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    let Some(header) = bytes.get(..HEADER_SIZE) else {
        return Err(FrameError::InsufficientData {
            needed: HEADER_SIZE,
            available: bytes.len(),
        });
    };

    let payload_len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let message_type = MessageType(u16::from_be_bytes([header[4], header[5]]));

    if payload_len > max_payload {
        return Err(FrameError::PayloadTooLarge {
            len: payload_len,
            max: max_payload,
        });
    }

    let total = HEADER_SIZE + payload_len;
    let Some(payload) = bytes.get(HEADER_SIZE..total) else {
        return Err(FrameError::InsufficientData {
            needed: total,
            available: bytes.len(),
        });
    };

    Ok((Frame::new(message_type, payload.to_vec()), total))
}

// ── Streaming decoder ─────────────────────────────────────────────────────────

/// Reassembles frames from a byte stream.
///
/// TCP (and TLS on top of it) is a stream: one `read()` may return part of a
/// frame, or several frames at once.  Push every chunk with
/// [`extend`](Self::extend) and drain complete frames with
/// [`next_frame`](Self::next_frame) until it returns `Ok(None)`.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload: usize,
}

impl FrameDecoder {
    /// Creates a decoder that rejects payloads longer than `max_payload`.
    pub fn new(max_payload: usize) -> Self {
        Self {
            buf: Vec::with_capacity(4096),
            max_payload,
        }
    }

    /// Appends newly received bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns the next complete frame, if one is buffered.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::PayloadTooLarge`] for an oversized length field.
    /// The stream cannot be resynchronised after that; the caller should drop
    /// the connection.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_frame(&self.buf, self.max_payload) {
            Ok((frame, consumed)) => {
                self.buf.drain(..consumed);
                trace!(
                    message_type = %frame.message_type,
                    len = frame.payload.len(),
                    "decoded frame"
                );
                Ok(Some(frame))
            }
            Err(FrameError::InsufficientData { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Call once the stream has ended.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InsufficientData`] if the stream stopped in the
    /// middle of a frame.
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        decode_frame(&self.buf, self.max_payload).map(|_| ())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
