//! Encoder and decoder for based frames.

use crate::error::ProtocolError;
use crate::frame::{FrameHeader, FRAME_HEADER_SIZE};
use crate::message::{ClientMessage, ServerMessage};
use bytes::{Buf, Bytes, BytesMut};

/// Encodes messages into frames.
pub struct Encoder;

impl Encoder {
    /// Encodes a client message into a frame.
    pub fn encode_client(message: &ClientMessage) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Encodes a server message into a frame.
    pub fn encode_server(message: &ServerMessage) -> Result<BytesMut, ProtocolError> {
        message.encode()
    }

    /// Concatenates several client frames into one buffer.
    pub fn encode_client_batch<'a, I>(messages: I) -> Result<BytesMut, ProtocolError>
    where
        I: IntoIterator<Item = &'a ClientMessage>,
    {
        let mut buf = BytesMut::new();
        for message in messages {
            message.encode_into(&mut buf)?;
        }
        Ok(buf)
    }
}

/// Buffering decoder for concatenated frames.
///
/// A frame whose body fails to decode is consumed, so the frames after it
/// stay readable. A header announcing an impossible length poisons the
/// stream and clears the buffer.
pub struct Decoder {
    buffer: BytesMut,
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Appends bytes to the internal buffer.
    pub fn extend_bytes(&mut self, data: Bytes) {
        self.buffer.extend_from_slice(&data);
    }

    /// Attempts to decode the next server message from the buffer.
    pub fn decode_server(&mut self) -> Result<Option<ServerMessage>, ProtocolError> {
        match self.next_frame(ServerMessage::frame_len)? {
            Some((header, body)) => ServerMessage::decode_body(&header, &body).map(Some),
            None => Ok(None),
        }
    }

    /// Attempts to decode the next client message from the buffer.
    pub fn decode_client(&mut self) -> Result<Option<ClientMessage>, ProtocolError> {
        match self.next_frame(ClientMessage::frame_len)? {
            Some((header, body)) => ClientMessage::decode_body(&header, &body).map(Some),
            None => Ok(None),
        }
    }

    /// Reports leftover bytes once the caller knows no more data will come.
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let declared = FrameHeader::peek(&self.buffer)
            .map(|h| h.length)
            .unwrap_or(FRAME_HEADER_SIZE);
        let available = self.buffer.len();
        self.buffer.clear();
        Err(ProtocolError::TruncatedFrame {
            declared,
            available,
        })
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    fn next_frame(
        &mut self,
        frame_len: fn(&FrameHeader) -> usize,
    ) -> Result<Option<(FrameHeader, BytesMut)>, ProtocolError> {
        if self.buffer.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let header = FrameHeader::peek(&self.buffer)?;
        let total = frame_len(&header);
        if total < FRAME_HEADER_SIZE {
            let actual = self.buffer.len();
            self.buffer.clear();
            return Err(ProtocolError::FrameTooShort {
                frame_type: header.frame_type,
                min: FRAME_HEADER_SIZE,
                actual,
            });
        }
        if self.buffer.len() < total {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total);
        frame.advance(FRAME_HEADER_SIZE);
        Ok(Some((header, frame)))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}
