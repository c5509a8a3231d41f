//! Length-prefixed CBOR framing.
//!
//! Each frame is a 4-byte big-endian payload length followed by the CBOR
//! encoding of one message. [`FrameDecoder`] accumulates bytes from any
//! number of partial reads and yields complete messages, so a read timeout
//! in the middle of a frame never loses data.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::Write;

/// Default upper bound on a single frame's payload.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Encodes a message into a complete frame.
pub fn encode_frame<T: Serialize>(message: &T, max_frame_size: usize) -> ProtocolResult<Bytes> {
    let mut frame = BytesMut::with_capacity(256);
    frame.put_u32(0);

    let mut writer = frame.writer();
    ciborium::into_writer(message, &mut writer).map_err(ProtocolError::encoding)?;
    let mut frame = writer.into_inner();

    let size = frame.len() - HEADER_LEN;
    if size > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }
    frame[..HEADER_LEN].copy_from_slice(&(size as u32).to_be_bytes());
    Ok(frame.freeze())
}

/// Encodes a message and writes the frame to `writer`.
pub fn write_frame<W: Write, T: Serialize>(
    writer: &mut W,
    message: &T,
    max_frame_size: usize,
) -> ProtocolResult<()> {
    let frame = encode_frame(message, max_frame_size)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

/// Incremental frame decoder.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Creates a decoder that rejects frames larger than `max_frame_size`.
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_frame_size,
        }
    }

    /// Appends received bytes.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Decodes the next complete message, or returns `None` if more bytes
    /// are needed.
    pub fn decode<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&self.buffer[..HEADER_LEN]);
        let size = u32::from_be_bytes(header) as usize;
        if size > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() < HEADER_LEN + size {
            self.buffer.reserve(HEADER_LEN + size - self.buffer.len());
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(HEADER_LEN + size);
        frame.advance(HEADER_LEN);
        let message = ciborium::from_reader(frame.reader()).map_err(ProtocolError::decoding)?;
        Ok(Some(message))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}
