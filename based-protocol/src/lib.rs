//! # based-protocol
//!
//! Wire protocol implementation for the based realtime platform.
//!
//! This crate provides:
//! - The 4-byte packed frame header and raw-deflate payload compression
//! - Client and server message codecs for every frame type
//! - Deterministic observable ids derived from a query name and payload
//! - Structural diff patches applied to cached observable values

pub mod codec;
pub mod diff;
pub mod error;
pub mod frame;
pub mod hash;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use diff::{apply_patch, PatchError};
pub use error::{ErrorPayload, ProtocolError};
pub use frame::{ClientFrameType, FrameHeader, ServerFrameType, FRAME_HEADER_SIZE};
pub use hash::{canonical_payload, obs_id};
pub use message::{ClientMessage, ServerMessage};

/// 64-bit observable / channel id.
pub type ObsId = u64;

/// Server-supplied version marker for a cached value.
pub type Checksum = u64;

/// 24-bit function call request id, carried in a `u32`.
pub type RequestId = u32;

/// Largest request id the 3-byte id field can carry.
pub const MAX_REQUEST_ID: RequestId = 0x00FF_FFFF;

/// Payloads strictly longer than this are deflated.
pub const COMPRESSION_THRESHOLD: usize = 150;

/// Maximum total frame size the 28-bit length field can express.
pub const MAX_FRAME_SIZE: usize = (1 << 27) - 1;
