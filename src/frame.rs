//! Length-prefixed frame codec.
//!
//! Wire format, symmetric for requests and responses:
//!
//! ```text
//! [4-byte big-endian length L][L bytes payload]
//! ```
//!
//! No escaping, no checksum, no version byte. Decoding never treats a short
//! read as a complete frame: `decode` returns `Ok(None)` until the buffer
//! holds the full declared length, and the caller reports a distinct
//! incomplete-frame condition if the peer closes first.

use bytes::{Buf, Bytes, BytesMut};

/// Length prefix size in bytes.
pub const HEADER_LEN: usize = 4;

/// Maximum accepted payload length. Anything larger is treated as a
/// protocol error rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame codec errors.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameError {
    /// Declared or requested length exceeds `MAX_FRAME_LEN`.
    Oversized { len: usize, max: usize },
    /// Peer closed the connection mid-frame; `buffered` bytes were pending.
    Incomplete { buffered: usize },
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::Oversized { len, max } => {
                write!(f, "frame length {len} exceeds maximum {max}")
            }
            FrameError::Incomplete { buffered } => {
                write!(f, "connection closed mid-frame with {buffered} bytes buffered")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for std::io::Error {
    fn from(e: FrameError) -> Self {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Encode a payload as a single frame.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>, FrameError> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len: payload.len(),
            max: MAX_FRAME_LEN,
        });
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Try to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffer does not yet contain a complete frame;
/// the length prefix (if present) is left in place so the caller can retry
/// after reading more data. On success the frame is consumed from `buf`.
pub fn decode(buf: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::Oversized {
            len,
            max: MAX_FRAME_LEN,
        });
    }

    if buf.len() < HEADER_LEN + len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    Ok(Some(buf.split_to(len).freeze()))
}
