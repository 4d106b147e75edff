//! # scriptcast-protocol
//!
//! Wire protocol for the scriptcast distribution system.
//!
//! This crate provides:
//! - [`FrameCodec`]: length-prefixed, zlib-compressed framing
//! - [`Packet`]: the closed catalogue of request/response kinds
//! - Legacy (obfuscated-object) and MessagePack body encodings behind one
//!   [`WireCodec`] selected per wire generation
//! - The static obfuscation map for legacy type descriptors
//! - [`ArtifactCipher`]: AES-256-CBC artifact encryption and checksums
//! - Compatibility arithmetic (JVM string hash, revision checksum, option
//!   obfuscation)
//!
//! ## Example
//!
//! ```
//! use scriptcast_protocol::{Packet, WireCodec, WireFormat};
//! use bytes::BytesMut;
//!
//! let codec = WireCodec::new(WireFormat::Current);
//! let packet = Packet::ScriptStartRequest;
//!
//! let frame = codec.encode(&packet, 0).unwrap();
//! let mut buf = BytesMut::from(&frame[..]);
//! let (decoded, counter) = codec.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(decoded, packet);
//! assert_eq!(counter, 0);
//! ```

pub mod compat;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod legacy;
pub mod msgpack;
pub mod obfuscation;
pub mod packets;
pub mod wire;

pub use crypto::{checksum_hex, ArtifactCipher};
pub use error::{CipherError, FramingError, FramingResult};
pub use frame::FrameCodec;
pub use packets::{ids, Packet, ScriptMetadata};
pub use wire::{WireCodec, WireFormat, NO_COUNTER};
