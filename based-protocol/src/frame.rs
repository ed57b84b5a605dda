//! Binary frame header and payload compression.
//!
//! Every frame starts with a 4-byte little-endian header:
//!
//! ```text
//! 31                              4   3      1      0
//! +--------------------------------+----------+-------+
//! |            length              |   type   | flag  |
//! |            28 bits             |  3 bits  | 1 bit |
//! +--------------------------------+----------+-------+
//! ```
//!
//! `flag` marks a deflated payload, except for channel-subscribe frames
//! where it marks a republish. Client frames count the header in `length`;
//! server frames count only the body.

use crate::error::ProtocolError;
use crate::{COMPRESSION_THRESHOLD, MAX_FRAME_SIZE};
use bytes::{BufMut, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Size of the packed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frame types sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientFrameType {
    Function = 0,
    Observe = 1,
    Unobserve = 2,
    Get = 3,
    Auth = 4,
    ChannelSubscribe = 5,
    ChannelPublish = 6,
    ChannelUnsubscribe = 7,
}

impl ClientFrameType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => Self::Function,
            1 => Self::Observe,
            2 => Self::Unobserve,
            3 => Self::Get,
            4 => Self::Auth,
            5 => Self::ChannelSubscribe,
            6 => Self::ChannelPublish,
            _ => Self::ChannelUnsubscribe,
        }
    }

    /// Minimum body size (bytes after the header) for this type.
    pub fn min_body_len(self) -> usize {
        match self {
            Self::Function => 3 + 1,
            Self::Observe | Self::Get => 8 + 8 + 1,
            Self::Unobserve | Self::ChannelUnsubscribe | Self::ChannelPublish => 8,
            Self::Auth => 0,
            Self::ChannelSubscribe => 8 + 1,
        }
    }
}

/// Frame types sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ServerFrameType {
    FunctionData = 0,
    SubscriptionData = 1,
    SubscriptionDiff = 2,
    GetUnchanged = 3,
    Auth = 4,
    Error = 5,
    ChannelRepublish = 6,
    SubTyped = 7,
}

impl ServerFrameType {
    pub fn from_u8(value: u8) -> Self {
        match value & 0x07 {
            0 => Self::FunctionData,
            1 => Self::SubscriptionData,
            2 => Self::SubscriptionDiff,
            3 => Self::GetUnchanged,
            4 => Self::Auth,
            5 => Self::Error,
            6 => Self::ChannelRepublish,
            _ => Self::SubTyped,
        }
    }

    /// Minimum body size (bytes after the header) for this type.
    pub fn min_body_len(self) -> usize {
        match self {
            Self::FunctionData => 3,
            Self::SubscriptionData => 16,
            Self::SubscriptionDiff => 24,
            Self::GetUnchanged | Self::ChannelRepublish => 8,
            Self::Auth | Self::Error => 0,
            Self::SubTyped => 1,
        }
    }
}

/// Unpacked frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Raw 3-bit type selector.
    pub frame_type: u8,
    /// Deflate (or republish) flag.
    pub flag: bool,
    /// Length field as carried on the wire.
    pub length: usize,
}

impl FrameHeader {
    pub fn new(frame_type: u8, flag: bool, length: usize) -> Self {
        Self {
            frame_type: frame_type & 0x07,
            flag,
            length,
        }
    }

    /// Packs the header into its 32-bit wire value.
    pub fn pack(&self) -> Result<u32, ProtocolError> {
        if self.length > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size: self.length,
                max: MAX_FRAME_SIZE,
            });
        }
        Ok(((self.length as u32) << 4) | ((self.frame_type as u32) << 1) | self.flag as u32)
    }

    /// Unpacks a 32-bit wire value.
    pub fn unpack(value: u32) -> Self {
        Self {
            frame_type: ((value & 0x0F) >> 1) as u8,
            flag: value & 1 == 1,
            length: (value >> 4) as usize,
        }
    }

    /// Appends the packed header to `buf`.
    pub fn write(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u32_le(self.pack()?);
        Ok(())
    }

    /// Reads a header from the start of `buf` without consuming it.
    pub fn peek(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(ProtocolError::IncompleteHeader {
                needed: FRAME_HEADER_SIZE - buf.len(),
            });
        }
        Ok(Self::unpack(u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]])))
    }
}

/// Deflates `data` (raw deflate stream, no zlib header).
pub fn deflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = DeflateEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
    encoder.write_all(data).map_err(ProtocolError::Compression)?;
    encoder.finish().map_err(ProtocolError::Compression)
}

/// Inflates a raw deflate stream. Fails on corrupt input.
pub fn inflate(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder
        .read_to_end(&mut out)
        .map_err(ProtocolError::Decompression)?;
    Ok(out)
}

/// Returns the bytes to put on the wire for a payload and whether they are deflated.
pub fn maybe_deflate(payload: &[u8]) -> Result<(Vec<u8>, bool), ProtocolError> {
    if payload.len() > COMPRESSION_THRESHOLD {
        Ok((deflate(payload)?, true))
    } else {
        Ok((payload.to_vec(), false))
    }
}

/// Reverses [`maybe_deflate`].
pub fn maybe_inflate(body: &[u8], deflated: bool) -> Result<Vec<u8>, ProtocolError> {
    if deflated && !body.is_empty() {
        inflate(body)
    } else {
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_pack_layout() {
        let header = FrameHeader::new(ClientFrameType::Observe as u8, true, 33);
        assert_eq!(header.pack().unwrap(), (33 << 4) | (1 << 1) | 1);
    }

    #[test]
    fn test_header_roundtrip() {
        for frame_type in 0..8u8 {
            for flag in [false, true] {
                let header = FrameHeader::new(frame_type, flag, 1234);
                assert_eq!(FrameHeader::unpack(header.pack().unwrap()), header);
            }
        }
    }

    #[test]
    fn test_header_little_endian() {
        let mut buf = BytesMut::new();
        FrameHeader::new(2, false, 12).write(&mut buf).unwrap();
        assert_eq!(&buf[..], &[0xC4, 0x00, 0x00, 0x00]);
        assert_eq!(
            FrameHeader::peek(&buf).unwrap(),
            FrameHeader::new(2, false, 12)
        );
    }

    #[test]
    fn test_header_too_large() {
        let header = FrameHeader::new(0, false, MAX_FRAME_SIZE + 1);
        assert!(matches!(
            header.pack(),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_peek_incomplete() {
        let result = FrameHeader::peek(&[1, 2]);
        assert!(matches!(
            result,
            Err(ProtocolError::IncompleteHeader { needed: 2 })
        ));
    }

    #[test]
    fn test_deflate_inflate() {
        let data = "abc".repeat(200);
        let compressed = deflate(data.as_bytes()).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(inflate(&compressed).unwrap(), data.as_bytes());
    }

    #[test]
    fn test_inflate_corrupt() {
        assert!(matches!(
            inflate(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(ProtocolError::Decompression(_))
        ));
    }

    #[test]
    fn test_compression_threshold() {
        let short = vec![b'a'; COMPRESSION_THRESHOLD];
        let (bytes, deflated) = maybe_deflate(&short).unwrap();
        assert!(!deflated);
        assert_eq!(bytes, short);

        let long = vec![b'a'; COMPRESSION_THRESHOLD + 1];
        let (bytes, deflated) = maybe_deflate(&long).unwrap();
        assert!(deflated);
        assert_eq!(maybe_inflate(&bytes, deflated).unwrap(), long);
    }

    #[test]
    fn test_type_tables() {
        assert_eq!(ClientFrameType::from_u8(5), ClientFrameType::ChannelSubscribe);
        assert_eq!(ServerFrameType::from_u8(5), ServerFrameType::Error);
        assert_eq!(ServerFrameType::SubscriptionDiff.min_body_len(), 24);
        assert_eq!(ClientFrameType::Unobserve.min_body_len(), 8);
    }
}
