//! Length-prefixed binary framing.
//!
//! Layout: `[version:u8][type:u8][len:u24 big-endian][payload]`. The length
//! covers the payload only. The codec never interprets the payload; the
//! `type` byte mirrors the message tag inside it so a router can dispatch
//! without decoding.

use thiserror::Error;

/// Wire protocol version carried in every frame header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Header is version + type + 24-bit length.
pub const HEADER_LEN: usize = 5;

/// Whole-frame cap; anything larger is rejected before the payload is read.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Payload cap implied by the frame cap.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - HEADER_LEN;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported frame version {0}")]
    VersionMismatch(u8),
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD_LEN} byte cap")]
    PayloadTooLarge(usize),
    #[error("frame truncated: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
    #[error("{0} bytes after the frame end")]
    TrailingBytes(usize),
}

/// One decoded frame. The version byte is validated away during decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode a single frame.
    pub fn encode(msg_type: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        let len = payload.len() as u32;
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.push(PROTOCOL_VERSION);
        out.push(msg_type);
        out.extend_from_slice(&len.to_be_bytes()[1..4]);
        out.extend_from_slice(payload);
        Ok(out)
    }

    /// Decode exactly one frame from `buf`. Trailing bytes are an error;
    /// use [`FrameDecoder`] for a byte stream.
    pub fn decode(buf: &[u8]) -> Result<Frame, FrameError> {
        let (frame, consumed) = decode_prefix(buf)?.ok_or(FrameError::Truncated {
            needed: needed_len(buf),
            have: buf.len(),
        })?;
        if consumed != buf.len() {
            return Err(FrameError::TrailingBytes(buf.len() - consumed));
        }
        Ok(frame)
    }
}

/// How many bytes a complete frame starting at `buf[0]` requires, as far as
/// the available header allows us to know.
fn needed_len(buf: &[u8]) -> usize {
    if buf.len() < HEADER_LEN {
        return HEADER_LEN;
    }
    HEADER_LEN + payload_len(buf)
}

fn payload_len(header: &[u8]) -> usize {
    u32::from_be_bytes([0, header[2], header[3], header[4]]) as usize
}

/// Try to decode one frame from the start of `buf`. `Ok(None)` means more
/// bytes are needed. Header validation happens as soon as the header is
/// complete, before any payload arrives.
fn decode_prefix(buf: &[u8]) -> Result<Option<(Frame, usize)>, FrameError> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }
    if buf[0] != PROTOCOL_VERSION {
        return Err(FrameError::VersionMismatch(buf[0]));
    }
    let len = payload_len(buf);
    if len > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLarge(len));
    }
    let total = HEADER_LEN + len;
    if buf.len() < total {
        return Ok(None);
    }
    Ok(Some((
        Frame {
            msg_type: buf[1],
            payload: buf[HEADER_LEN..total].to_vec(),
        },
        total,
    )))
}

/// Incremental decoder for a contiguous byte stream.
///
/// Feed raw bytes in, pull complete frames out. Any error is fatal to the
/// stream; the caller must drop the connection.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete frame, or `None` until more bytes arrive.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        match decode_prefix(&self.buf)? {
            Some((frame, consumed)) => {
                self.buf.drain(..consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
