//! Length-prefixed framing for JSON payloads over stream sockets.
//!
//! Every message on the wire is a 4-byte big-endian length followed by exactly
//! that many payload bytes:
//!
//! ```text
//! +----------------+----------------------------+
//! | length (u32BE) | payload (UTF-8 JSON bytes) |
//! +----------------+----------------------------+
//! ```
//!
//! The length counts the payload only, never the header. Decoding is pure:
//! [`try_decode`] takes whatever bytes have arrived so far and splits them into
//! complete payloads plus an unconsumed remainder. [`ReceiveBuffer`] wraps that
//! for a connection that reads in arbitrary chunks.

use thiserror::Error;

/// Size of the length prefix in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum accepted payload length (10 MiB).
///
/// A peer declaring more than this is treated as broken or hostile and the
/// connection is closed.
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024;

/// A frame header declared a payload larger than [`MAX_FRAME_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Frame of {declared} bytes exceeds maximum {max} bytes")]
pub struct FrameTooLarge {
    /// Length announced by the header.
    pub declared: u32,
    /// Limit in force when the header was read.
    pub max: u32,
}

/// Encode a payload as a single wire frame.
///
/// Payloads above [`MAX_FRAME_LEN`] are encoded faithfully but the peer will
/// reject them; callers that care check [`check_len`] first.
///
/// # Panics
///
/// Panics if the payload is longer than `u32::MAX` bytes, which the header
/// cannot express.
///
/// # Example
///
/// ```
/// let frame = storelink::transport::encode(br#"{"action":"ping"}"#);
/// assert_eq!(&frame[..4], &[0, 0, 0, 17]);
/// ```
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&length_prefix(payload.len()));
    frame.extend_from_slice(payload);
    frame
}

fn length_prefix(len: usize) -> [u8; HEADER_LEN] {
    match u32::try_from(len) {
        Ok(len) => len.to_be_bytes(),
        Err(_) => panic!("payload of {} bytes does not fit a u32 length prefix", len),
    }
}

/// Serialize a JSON value and encode it as a frame.
pub fn encode_json(value: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    let payload = serde_json::to_vec(value)?;
    Ok(encode(&payload))
}

/// Reject payload lengths the receiving side would refuse.
pub fn check_len(len: usize) -> Result<(), FrameTooLarge> {
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameTooLarge {
            declared: u32::try_from(len).unwrap_or(u32::MAX),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(())
}

/// Split a byte buffer into complete payloads and an unconsumed remainder.
///
/// Reads headers for as long as at least [`HEADER_LEN`] bytes remain. Stops at
/// the first frame whose payload has not fully arrived and returns everything
/// from that header onwards as the remainder. Feeding the remainder plus newly
/// received bytes back in continues exactly where this call stopped.
///
/// # Errors
///
/// Returns [`FrameTooLarge`] if any header in the buffer declares a payload
/// above [`MAX_FRAME_LEN`]. No frames are returned in that case.
pub fn try_decode(buf: &[u8]) -> Result<(Vec<Vec<u8>>, &[u8]), FrameTooLarge> {
    let mut frames = Vec::new();
    let mut rest = buf;

    while rest.len() >= HEADER_LEN {
        let declared = u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]);
        if declared > MAX_FRAME_LEN {
            return Err(FrameTooLarge {
                declared,
                max: MAX_FRAME_LEN,
            });
        }

        let end = HEADER_LEN + declared as usize;
        if rest.len() < end {
            break;
        }

        frames.push(rest[HEADER_LEN..end].to_vec());
        rest = &rest[end..];
    }

    Ok((frames, rest))
}

/// Append-only accumulator for bytes read from a socket.
///
/// After every [`drain_frames`](Self::drain_frames) the buffer holds either
/// nothing or the prefix of a frame that has not fully arrived yet.
#[derive(Debug, Default)]
pub struct ReceiveBuffer {
    buf: Vec<u8>,
}

impl ReceiveBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(8 * 1024),
        }
    }

    /// Append newly received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Extract every complete payload, keeping only an incomplete tail.
    ///
    /// On [`FrameTooLarge`] the buffer is cleared; the stream can no longer be
    /// resynchronised and the connection must be closed.
    pub fn drain_frames(&mut self) -> Result<Vec<Vec<u8>>, FrameTooLarge> {
        let (frames, consumed) = match try_decode(&self.buf) {
            Ok((frames, remainder)) => {
                let consumed = self.buf.len() - remainder.len();
                (frames, consumed)
            }
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };

        self.buf.drain(..consumed);
        Ok(frames)
    }

    /// Number of buffered bytes not yet part of a complete frame.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Discard all buffered bytes (used when a connection is torn down).
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
