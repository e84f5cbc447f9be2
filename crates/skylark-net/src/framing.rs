//! Length-prefixed message framing over a TCP byte stream.
//!
//! Each frame on the wire is a `u32` little-endian length followed by a
//! `u16` little-endian message kind and the payload bytes. The length
//! counts the kind and the payload, not itself. Incoming bytes arrive in
//! arbitrary chunks, so [`FrameDecoder`] accumulates partial frames across
//! calls and yields every complete [`Envelope`] it can.

use skylark_config::NetConfig;
use thiserror::Error;

/// Bytes occupied by the length prefix.
const HEADER_LEN: usize = 4;
/// Bytes occupied by the message kind inside the frame body.
const KIND_LEN: usize = 2;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors produced while encoding or decoding frames.
#[derive(Debug, Error)]
pub enum FrameError {
    /// Payload exceeds the configured maximum size.
    #[error("payload too large: {size} bytes exceeds max {max}")]
    PayloadTooLarge { size: usize, max: usize },

    /// A frame declared a body shorter than the message kind field.
    #[error("frame too short: {size} bytes cannot hold a message kind")]
    FrameTooShort { size: usize },
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// A decoded frame: the message kind and its raw payload.
///
/// The payload is left opaque here. Decoding it into a typed message is the
/// concern of [`crate::messages`] and whichever handler claims the kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Application-level message kind, used for dispatch.
    pub kind: u16,
    /// Serialized message body.
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Frame configuration
// ---------------------------------------------------------------------------

/// Framing limits, derived from the network configuration.
#[derive(Debug, Clone, Copy)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes.
    pub max_payload_size: usize,
}

impl FrameConfig {
    pub fn new(config: &NetConfig) -> Self {
        Self {
            max_payload_size: config.max_payload_size,
        }
    }
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_payload_size: 1024 * 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

/// Encode a single frame ready to be written to the wire.
///
/// Returns [`FrameError::PayloadTooLarge`] if the payload exceeds the
/// configured maximum.
pub fn encode_frame(
    kind: u16,
    payload: &[u8],
    config: &FrameConfig,
) -> Result<Vec<u8>, FrameError> {
    if payload.len() > config.max_payload_size {
        return Err(FrameError::PayloadTooLarge {
            size: payload.len(),
            max: config.max_payload_size,
        });
    }

    let body_len = KIND_LEN + payload.len();
    let mut frame = Vec::with_capacity(HEADER_LEN + body_len);
    frame.extend_from_slice(&(body_len as u32).to_le_bytes());
    frame.extend_from_slice(&kind.to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Incremental frame decoder.
///
/// Bytes read off the socket are fed in as they arrive; the decoder buffers
/// whatever does not yet form a complete frame and returns the envelopes
/// that do. A decode error means the stream is corrupt and the connection
/// should be dropped, since frame boundaries can no longer be trusted.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_payload_size: usize,
}

impl FrameDecoder {
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            buf: Vec::new(),
            max_payload_size: config.max_payload_size,
        }
    }

    /// Feed a chunk of bytes and collect every complete frame.
    ///
    /// Partial trailing data is retained for the next call. On error the
    /// internal buffer is cleared, as the stream position is unrecoverable.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Envelope>, FrameError> {
        self.buf.extend_from_slice(chunk);

        let mut envelopes = Vec::new();
        let mut consumed = 0;

        loop {
            let remaining = &self.buf[consumed..];
            if remaining.len() < HEADER_LEN {
                break;
            }

            let body_len =
                u32::from_le_bytes([remaining[0], remaining[1], remaining[2], remaining[3]])
                    as usize;
            if body_len < KIND_LEN {
                self.buf.clear();
                return Err(FrameError::FrameTooShort { size: body_len });
            }
            let payload_len = body_len - KIND_LEN;
            if payload_len > self.max_payload_size {
                self.buf.clear();
                return Err(FrameError::PayloadTooLarge {
                    size: payload_len,
                    max: self.max_payload_size,
                });
            }

            if remaining.len() < HEADER_LEN + body_len {
                break;
            }

            let kind = u16::from_le_bytes([remaining[HEADER_LEN], remaining[HEADER_LEN + 1]]);
            let payload_start = HEADER_LEN + KIND_LEN;
            let payload = remaining[payload_start..HEADER_LEN + body_len].to_vec();
            envelopes.push(Envelope { kind, payload });
            consumed += HEADER_LEN + body_len;
        }

        if consumed > 0 {
            self.buf.drain(..consumed);
        }
        Ok(envelopes)
    }

    /// Discard any buffered partial frame. Called when a connection is
    /// replaced, so stale bytes never bleed into the next stream.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Bytes currently buffered awaiting the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
