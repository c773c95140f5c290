//! Length-prefixed frame codec
//!
//! Each frame is a 4-byte big-endian length followed by that many bytes of
//! MessagePack. Frames are written back to back with no delimiter.

use crate::{Message, ProtocolError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Size of the length prefix in bytes
pub const LENGTH_PREFIX_LEN: usize = 4;

/// Messages and per-frame errors produced by one [`FrameCodec::decode`] call
#[derive(Debug, Default)]
pub struct Decoded {
    /// Messages decoded from complete frames, in stream order
    pub messages: Vec<Message>,
    /// Errors for frames that were dropped
    pub errors: Vec<ProtocolError>,
}

/// Frame codec with a per-connection reassembly buffer
pub struct FrameCodec {
    /// Bytes received but not yet forming a complete frame
    read_buf: BytesMut,
    /// Maximum frame size allowed
    max_frame_size: usize,
    /// Payload bytes of an oversized frame still to be discarded
    skip_remaining: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new frame codec with default settings
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    /// Create a new frame codec with custom max frame size
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            read_buf: BytesMut::with_capacity(8192),
            max_frame_size,
            skip_remaining: 0,
        }
    }

    /// Encode a message to bytes with length prefix
    pub fn encode(&self, message: &Message) -> Result<Bytes, ProtocolError> {
        // Named fields so the peer sees a map, not a positional array
        let body = rmp_serde::to_vec_named(message)?;

        let too_large = || ProtocolError::FrameTooLarge {
            size: body.len(),
            max: self.max_frame_size,
        };
        if body.len() > self.max_frame_size {
            return Err(too_large());
        }
        let declared = u32::try_from(body.len()).map_err(|_| too_large())?;

        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + body.len());
        buf.put_u32(declared);
        buf.put_slice(&body);

        Ok(buf.freeze())
    }

    /// Append received bytes and decode every complete frame now available.
    ///
    /// A frame that fails to decode is reported in [`Decoded::errors`] and
    /// skipped; frames before and after it are still returned. Bytes of an
    /// incomplete trailing frame stay buffered for the next call.
    pub fn decode(&mut self, data: &[u8]) -> Decoded {
        self.read_buf.extend_from_slice(data);

        let mut decoded = Decoded::default();
        loop {
            match self.try_decode_message() {
                Ok(Some(message)) => decoded.messages.push(message),
                Ok(None) => break,
                Err(e) => decoded.errors.push(e),
            }
        }
        decoded
    }

    /// Try to decode one message from the internal buffer.
    ///
    /// Every `Err` consumes the offending frame, so calling again resumes
    /// with the next frame.
    pub fn try_decode_message(&mut self) -> Result<Option<Message>, ProtocolError> {
        if self.skip_remaining > 0 {
            let n = self.skip_remaining.min(self.read_buf.len());
            self.read_buf.advance(n);
            self.skip_remaining -= n;
            if self.skip_remaining > 0 {
                return Ok(None);
            }
        }

        if self.read_buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }

        // Peek the length prefix without consuming it
        let frame_len = (&self.read_buf[..LENGTH_PREFIX_LEN]).get_u32() as usize;

        if frame_len > self.max_frame_size {
            // Drop the prefix and discard the body as it arrives to stay in sync
            self.read_buf.advance(LENGTH_PREFIX_LEN);
            let n = frame_len.min(self.read_buf.len());
            self.read_buf.advance(n);
            self.skip_remaining = frame_len - n;
            return Err(ProtocolError::FrameTooLarge {
                size: frame_len,
                max: self.max_frame_size,
            });
        }

        if self.read_buf.len() < LENGTH_PREFIX_LEN + frame_len {
            return Ok(None);
        }

        self.read_buf.advance(LENGTH_PREFIX_LEN);
        let body = self.read_buf.split_to(frame_len);

        let message = rmp_serde::from_slice::<Message>(&body)?;
        Ok(Some(message))
    }

    /// Write a message to an async writer
    pub async fn write_message<W>(&self, writer: &mut W, message: &Message) -> Result<(), ProtocolError>
    where
        W: AsyncWrite + Unpin,
    {
        let encoded = self.encode(message)?;
        writer.write_all(&encoded).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Read one message from an async reader.
    ///
    /// Returns `Ok(None)` on a clean end of stream. A decode error consumes
    /// its frame, so the caller may keep reading after it.
    pub async fn read_message<R>(&mut self, reader: &mut R) -> Result<Option<Message>, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        loop {
            if let Some(message) = self.try_decode_message()? {
                return Ok(Some(message));
            }

            let mut temp_buf = [0u8; 8192];
            let n = reader.read(&mut temp_buf).await?;

            if n == 0 {
                if self.read_buf.is_empty() && self.skip_remaining == 0 {
                    return Ok(None);
                }
                return Err(ProtocolError::Truncated {
                    buffered: self.read_buf.len(),
                });
            }

            self.read_buf.extend_from_slice(&temp_buf[..n]);
        }
    }

    /// Bytes currently buffered waiting for the rest of a frame
    pub fn buffer_size(&self) -> usize {
        self.read_buf.len()
    }

    /// Clear the internal buffer
    pub fn clear_buffer(&mut self) {
        self.read_buf.clear();
        self.skip_remaining = 0;
    }
}
