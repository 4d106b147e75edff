//! One codec per connection: framing plus the generation-specific body
//! encoding.
//!
//! The two wire generations share the outer framing but disagree on body
//! layout. [`WireFormat::Legacy`] carries descriptor-tagged object bodies and
//! no sequence counters; [`WireFormat::Current`] carries MessagePack bodies
//! with per-direction counters and the optional wrapped-timestamp envelope.

use bytes::{Bytes, BytesMut};

use crate::error::FramingResult;
use crate::frame::FrameCodec;
use crate::packets::Packet;
use crate::{legacy, msgpack};

/// Counter value reported for bodies that carry none.
pub const NO_COUNTER: i32 = -1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// Obfuscated-object bodies, no counters.
    Legacy,
    /// MessagePack bodies with sequence counters.
    Current,
}

/// Frame + body codec for one connection.
#[derive(Debug, Clone)]
pub struct WireCodec {
    format: WireFormat,
    framing: FrameCodec,
}

impl WireCodec {
    pub fn new(format: WireFormat) -> Self {
        Self {
            format,
            framing: FrameCodec::new(),
        }
    }

    pub fn with_framing(format: WireFormat, framing: FrameCodec) -> Self {
        Self { format, framing }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encodes one packet into a complete frame. `counter` is carried only by
    /// the current generation.
    pub fn encode(&self, packet: &Packet, counter: i32) -> FramingResult<Bytes> {
        let body = match self.format {
            WireFormat::Legacy => legacy::encode_body(packet)?,
            WireFormat::Current => msgpack::encode_body(packet, counter)?,
        };
        self.framing.encode(&body)
    }

    /// Takes one complete packet off the front of `buf`, or returns
    /// `Ok(None)` when a full frame has not arrived yet. Legacy bodies report
    /// [`NO_COUNTER`].
    pub fn decode(&self, buf: &mut BytesMut) -> FramingResult<Option<(Packet, i32)>> {
        let Some(body) = self.framing.decode(buf)? else {
            return Ok(None);
        };
        let decoded = match self.format {
            WireFormat::Legacy => (legacy::decode_body(body)?, NO_COUNTER),
            WireFormat::Current => msgpack::decode_body(body)?,
        };
        Ok(Some(decoded))
    }
}
