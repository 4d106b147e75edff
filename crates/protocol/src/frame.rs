//! Length-prefixed, zlib-compressed framing.
//!
//! Wire layout, outer to inner: 4-byte big-endian length prefix, zlib
//! deflate stream, body bytes. The prefix counts the *compressed* payload.
//! Any corruption is fatal; the stream has no resync point.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::error::{FramingError, FramingResult};

/// Default ceiling on the compressed payload of one frame.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Splits a byte stream into frames and assembles outgoing ones.
///
/// Decoding is incremental: feed the read buffer and get back either a
/// complete decompressed body, `None` when more bytes are needed, or a fatal
/// [`FramingError`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    pub fn new() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Compresses a body and prefixes it with its compressed length.
    pub fn encode(&self, body: &[u8]) -> FramingResult<Bytes> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(body)
            .and_then(|_| encoder.finish())
            .map_err(|e| FramingError::Compress(e.to_string()))
            .map(|compressed| {
                let mut out = BytesMut::with_capacity(4 + compressed.len());
                out.put_u32(compressed.len() as u32);
                out.put_slice(&compressed);
                out.freeze()
            })
    }

    /// Tries to take one complete frame off the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a full frame; the
    /// buffer is left untouched in that case.
    pub fn decode(&self, buf: &mut BytesMut) -> FramingResult<Option<Bytes>> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let declared = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if declared > self.max_frame {
            return Err(FramingError::FrameTooLarge {
                declared,
                max: self.max_frame,
            });
        }
        if buf.len() < 4 + declared {
            return Ok(None);
        }

        buf.advance(4);
        let compressed = buf.split_to(declared);

        let mut decoder = ZlibDecoder::new(compressed.as_ref());
        let mut body = Vec::new();
        decoder
            .read_to_end(&mut body)
            .map_err(|e| FramingError::Decompress(e.to_string()))?;

        // The declared length must cover the zlib stream exactly; leftover
        // input means the peer's framing is out of step with its compressor.
        let consumed = decoder.total_in() as usize;
        if consumed != declared {
            return Err(FramingError::TrailingBytes {
                remaining: declared - consumed,
            });
        }

        Ok(Some(Bytes::from(body)))
    }
}
