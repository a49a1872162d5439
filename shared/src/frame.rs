//! Frame layout and stream framing.
//!
//! Every frame on the wire is `length: u16 | type_id: u16 | payload`, both
//! header fields little-endian. `length` counts the whole frame including
//! the four header bytes, so a valid frame always satisfies
//! `length == HEADER_SIZE + payload.len()`.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_SIZE: usize = 4;
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - HEADER_SIZE;

/// Errors produced while framing or decoding wire data.
///
/// All of these mean the byte stream can no longer be trusted; the owning
/// connection must be closed rather than resynchronized.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame shorter than header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("declared length {declared} is smaller than the 4-byte header")]
    LengthBelowHeader { declared: u16 },

    #[error("declared length {declared} does not match frame size {actual}")]
    LengthMismatch { declared: u16, actual: usize },

    #[error("payload for type {type_id} is malformed: {reason}")]
    Payload { type_id: u16, reason: String },

    #[error("payload of {0} bytes does not fit in a frame")]
    FrameTooLarge(usize),

    #[error("expected message type {expected}, got {actual}")]
    TypeMismatch { expected: u16, actual: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub length: u16,
    pub type_id: u16,
}

impl FrameHeader {
    /// Reads the header from the front of `buf` and validates the declared length.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        if buf.len() < HEADER_SIZE {
            return Err(CodecError::TruncatedHeader(buf.len()));
        }

        let mut cursor = &buf[..HEADER_SIZE];
        let length = cursor.get_u16_le();
        let type_id = cursor.get_u16_le();

        if (length as usize) < HEADER_SIZE {
            return Err(CodecError::LengthBelowHeader { declared: length });
        }

        Ok(Self { length, type_id })
    }

    pub fn payload_len(&self) -> usize {
        self.length as usize - HEADER_SIZE
    }
}

/// A complete frame: type tag plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub type_id: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(type_id: u16, payload: Bytes) -> Result<Self, CodecError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(CodecError::FrameTooLarge(payload.len()));
        }
        Ok(Self { type_id, payload })
    }

    /// Total encoded size, header included.
    pub fn length(&self) -> u16 {
        (HEADER_SIZE + self.payload.len()) as u16
    }

    pub fn header(&self) -> FrameHeader {
        FrameHeader {
            length: self.length(),
            type_id: self.type_id,
        }
    }

    /// Parses exactly one frame. The slice must hold the whole frame and
    /// nothing else.
    pub fn parse(buf: &[u8]) -> Result<Self, CodecError> {
        let header = FrameHeader::parse(buf)?;
        if header.length as usize != buf.len() {
            return Err(CodecError::LengthMismatch {
                declared: header.length,
                actual: buf.len(),
            });
        }

        Ok(Self {
            type_id: header.type_id,
            payload: Bytes::copy_from_slice(&buf[HEADER_SIZE..]),
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        out.put_u16_le(self.length());
        out.put_u16_le(self.type_id);
        out.put_slice(&self.payload);
        out.freeze()
    }
}

/// Accumulates stream bytes and cuts them into frames.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, `Ok(None)` if more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::parse(&self.buffer)?;
        if self.buffer.len() < header.length as usize {
            return Ok(None);
        }

        let mut raw = self.buffer.split_to(header.length as usize);
        raw.advance(HEADER_SIZE);

        Ok(Some(Frame {
            type_id: header.type_id,
            payload: raw.freeze(),
        }))
    }
}
