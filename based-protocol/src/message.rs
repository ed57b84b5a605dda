//! Typed client and server messages.
//!
//! Body layouts (after the 4-byte header, all integers little-endian):
//!
//! ```text
//! client  0 function             | 3 id | 1 name len | name | [payload] |
//!         1 observe / 3 get      | 8 id | 8 checksum | 1 name len | name | [payload] |
//!         2 unobserve / 7 unsub  | 8 id |
//!         4 auth                 | [payload] |
//!         5 channel subscribe    | 8 id | 1 name len | name | [payload] |   flag = republish
//!         6 channel publish      | 8 id | [payload] |
//!
//! server  0 function result      | 3 id | [payload] |
//!         1 observable data      | 8 id | 8 checksum | [payload] |
//!         2 observable diff      | 8 id | 8 checksum | 8 prev checksum | [patch] |
//!         3 get unchanged        | 8 id |
//!         4 auth                 | [payload] |
//!         5 error                | [json] |
//!         6 channel republish    | 8 id |
//!         7 sub-typed            | 1 sub type | ... |   sub type 0: | 8 id | [payload] |
//! ```

use crate::error::{ErrorPayload, ProtocolError};
use crate::frame::{
    maybe_deflate, maybe_inflate, ClientFrameType, FrameHeader, ServerFrameType,
    FRAME_HEADER_SIZE,
};
use crate::{Checksum, ObsId, RequestId, MAX_REQUEST_ID};
use bytes::{Buf, BufMut, BytesMut};

/// Sub-type of a server sub-typed frame carrying a channel message.
pub const SUB_TYPE_CHANNEL_MESSAGE: u8 = 0;

/// Messages sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Function {
        request_id: RequestId,
        name: String,
        payload: String,
    },
    Observe {
        id: ObsId,
        checksum: Checksum,
        name: String,
        payload: String,
    },
    Unobserve {
        id: ObsId,
    },
    Get {
        id: ObsId,
        checksum: Checksum,
        name: String,
        payload: String,
    },
    Auth {
        state: String,
    },
    ChannelSubscribe {
        id: ObsId,
        name: String,
        payload: String,
        republish: bool,
    },
    ChannelPublish {
        id: ObsId,
        payload: String,
    },
    ChannelUnsubscribe {
        id: ObsId,
    },
}

impl ClientMessage {
    pub fn frame_type(&self) -> ClientFrameType {
        match self {
            ClientMessage::Function { .. } => ClientFrameType::Function,
            ClientMessage::Observe { .. } => ClientFrameType::Observe,
            ClientMessage::Unobserve { .. } => ClientFrameType::Unobserve,
            ClientMessage::Get { .. } => ClientFrameType::Get,
            ClientMessage::Auth { .. } => ClientFrameType::Auth,
            ClientMessage::ChannelSubscribe { .. } => ClientFrameType::ChannelSubscribe,
            ClientMessage::ChannelPublish { .. } => ClientFrameType::ChannelPublish,
            ClientMessage::ChannelUnsubscribe { .. } => ClientFrameType::ChannelUnsubscribe,
        }
    }

    /// Encodes the message into a standalone frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let mut flag = false;

        match self {
            ClientMessage::Function {
                request_id,
                name,
                payload,
            } => {
                if *request_id > MAX_REQUEST_ID {
                    return Err(ProtocolError::RequestIdOutOfRange(*request_id));
                }
                body.put_uint_le(*request_id as u64, 3);
                put_name(&mut body, name)?;
                flag = put_payload(&mut body, payload)?;
            }
            ClientMessage::Observe {
                id,
                checksum,
                name,
                payload,
            }
            | ClientMessage::Get {
                id,
                checksum,
                name,
                payload,
            } => {
                body.put_u64_le(*id);
                body.put_u64_le(*checksum);
                put_name(&mut body, name)?;
                flag = put_payload(&mut body, payload)?;
            }
            ClientMessage::Unobserve { id } | ClientMessage::ChannelUnsubscribe { id } => {
                body.put_u64_le(*id);
            }
            ClientMessage::Auth { state } => {
                flag = put_payload(&mut body, state)?;
            }
            ClientMessage::ChannelSubscribe {
                id,
                name,
                payload,
                republish,
            } => {
                body.put_u64_le(*id);
                put_name(&mut body, name)?;
                // Never deflated: the flag bit carries the republish marker.
                body.put_slice(payload.as_bytes());
                flag = *republish;
            }
            ClientMessage::ChannelPublish { id, payload } => {
                body.put_u64_le(*id);
                flag = put_payload(&mut body, payload)?;
            }
        }

        let header = FrameHeader::new(
            self.frame_type() as u8,
            flag,
            FRAME_HEADER_SIZE + body.len(),
        );
        buf.reserve(FRAME_HEADER_SIZE + body.len());
        header.write(buf)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Total frame size (header included) announced by a client header.
    pub fn frame_len(header: &FrameHeader) -> usize {
        header.length
    }

    /// Decodes a message body given its already-parsed header.
    pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let frame_type = ClientFrameType::from_u8(header.frame_type);
        ensure_len(header.frame_type, frame_type.min_body_len(), body.len())?;
        let mut cur = body;

        let message = match frame_type {
            ClientFrameType::Function => {
                let request_id = cur.get_uint_le(3) as RequestId;
                let name = take_name(header.frame_type, &mut cur)?;
                let payload = take_payload(cur, header.flag)?;
                ClientMessage::Function {
                    request_id,
                    name,
                    payload,
                }
            }
            ClientFrameType::Observe | ClientFrameType::Get => {
                let id = cur.get_u64_le();
                let checksum = cur.get_u64_le();
                let name = take_name(header.frame_type, &mut cur)?;
                let payload = take_payload(cur, header.flag)?;
                if frame_type == ClientFrameType::Observe {
                    ClientMessage::Observe {
                        id,
                        checksum,
                        name,
                        payload,
                    }
                } else {
                    ClientMessage::Get {
                        id,
                        checksum,
                        name,
                        payload,
                    }
                }
            }
            ClientFrameType::Unobserve => ClientMessage::Unobserve {
                id: cur.get_u64_le(),
            },
            ClientFrameType::ChannelUnsubscribe => ClientMessage::ChannelUnsubscribe {
                id: cur.get_u64_le(),
            },
            ClientFrameType::Auth => ClientMessage::Auth {
                state: take_payload(cur, header.flag)?,
            },
            ClientFrameType::ChannelSubscribe => {
                let id = cur.get_u64_le();
                let name = take_name(header.frame_type, &mut cur)?;
                let payload = take_payload(cur, false)?;
                ClientMessage::ChannelSubscribe {
                    id,
                    name,
                    payload,
                    republish: header.flag,
                }
            }
            ClientFrameType::ChannelPublish => {
                let id = cur.get_u64_le();
                let payload = take_payload(cur, header.flag)?;
                ClientMessage::ChannelPublish { id, payload }
            }
        };

        Ok(message)
    }
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    FunctionData {
        request_id: RequestId,
        payload: String,
    },
    SubscriptionData {
        id: ObsId,
        checksum: Checksum,
        payload: String,
    },
    SubscriptionDiff {
        id: ObsId,
        checksum: Checksum,
        prev_checksum: Checksum,
        patch: String,
    },
    GetUnchanged {
        id: ObsId,
    },
    Auth {
        payload: String,
    },
    Error(ErrorPayload),
    ChannelRepublish {
        id: ObsId,
    },
    ChannelMessage {
        id: ObsId,
        payload: String,
    },
}

impl ServerMessage {
    pub fn frame_type(&self) -> ServerFrameType {
        match self {
            ServerMessage::FunctionData { .. } => ServerFrameType::FunctionData,
            ServerMessage::SubscriptionData { .. } => ServerFrameType::SubscriptionData,
            ServerMessage::SubscriptionDiff { .. } => ServerFrameType::SubscriptionDiff,
            ServerMessage::GetUnchanged { .. } => ServerFrameType::GetUnchanged,
            ServerMessage::Auth { .. } => ServerFrameType::Auth,
            ServerMessage::Error(_) => ServerFrameType::Error,
            ServerMessage::ChannelRepublish { .. } => ServerFrameType::ChannelRepublish,
            ServerMessage::ChannelMessage { .. } => ServerFrameType::SubTyped,
        }
    }

    /// Encodes the message into a standalone frame.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf)?;
        Ok(buf)
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut body = BytesMut::new();
        let mut flag = false;

        match self {
            ServerMessage::FunctionData {
                request_id,
                payload,
            } => {
                if *request_id > MAX_REQUEST_ID {
                    return Err(ProtocolError::RequestIdOutOfRange(*request_id));
                }
                body.put_uint_le(*request_id as u64, 3);
                flag = put_payload(&mut body, payload)?;
            }
            ServerMessage::SubscriptionData {
                id,
                checksum,
                payload,
            } => {
                body.put_u64_le(*id);
                body.put_u64_le(*checksum);
                flag = put_payload(&mut body, payload)?;
            }
            ServerMessage::SubscriptionDiff {
                id,
                checksum,
                prev_checksum,
                patch,
            } => {
                body.put_u64_le(*id);
                body.put_u64_le(*checksum);
                body.put_u64_le(*prev_checksum);
                flag = put_payload(&mut body, patch)?;
            }
            ServerMessage::GetUnchanged { id } | ServerMessage::ChannelRepublish { id } => {
                body.put_u64_le(*id);
            }
            ServerMessage::Auth { payload } => {
                flag = put_payload(&mut body, payload)?;
            }
            ServerMessage::Error(error) => {
                flag = put_payload(&mut body, &error.raw)?;
            }
            ServerMessage::ChannelMessage { id, payload } => {
                body.put_u8(SUB_TYPE_CHANNEL_MESSAGE);
                body.put_u64_le(*id);
                flag = put_payload(&mut body, payload)?;
            }
        }

        let header = FrameHeader::new(self.frame_type() as u8, flag, body.len());
        buf.reserve(FRAME_HEADER_SIZE + body.len());
        header.write(buf)?;
        buf.put_slice(&body);
        Ok(())
    }

    /// Total frame size (header included) announced by a server header.
    pub fn frame_len(header: &FrameHeader) -> usize {
        FRAME_HEADER_SIZE + header.length
    }

    /// Decodes a message body given its already-parsed header.
    pub fn decode_body(header: &FrameHeader, body: &[u8]) -> Result<Self, ProtocolError> {
        let frame_type = ServerFrameType::from_u8(header.frame_type);
        ensure_len(header.frame_type, frame_type.min_body_len(), body.len())?;
        let mut cur = body;

        let message = match frame_type {
            ServerFrameType::FunctionData => {
                let request_id = cur.get_uint_le(3) as RequestId;
                ServerMessage::FunctionData {
                    request_id,
                    payload: take_payload(cur, header.flag)?,
                }
            }
            ServerFrameType::SubscriptionData => {
                let id = cur.get_u64_le();
                let checksum = cur.get_u64_le();
                ServerMessage::SubscriptionData {
                    id,
                    checksum,
                    payload: take_payload(cur, header.flag)?,
                }
            }
            ServerFrameType::SubscriptionDiff => {
                let id = cur.get_u64_le();
                let checksum = cur.get_u64_le();
                let prev_checksum = cur.get_u64_le();
                ServerMessage::SubscriptionDiff {
                    id,
                    checksum,
                    prev_checksum,
                    patch: take_payload(cur, header.flag)?,
                }
            }
            ServerFrameType::GetUnchanged => ServerMessage::GetUnchanged {
                id: cur.get_u64_le(),
            },
            ServerFrameType::Auth => ServerMessage::Auth {
                payload: take_payload(cur, header.flag)?,
            },
            ServerFrameType::Error => {
                let text = take_payload(cur, header.flag)?;
                ServerMessage::Error(ErrorPayload::parse(&text)?)
            }
            ServerFrameType::ChannelRepublish => ServerMessage::ChannelRepublish {
                id: cur.get_u64_le(),
            },
            ServerFrameType::SubTyped => {
                let sub_type = cur.get_u8();
                if sub_type != SUB_TYPE_CHANNEL_MESSAGE {
                    return Err(ProtocolError::UnknownSubType(sub_type));
                }
                ensure_len(header.frame_type, 9, body.len())?;
                let id = cur.get_u64_le();
                ServerMessage::ChannelMessage {
                    id,
                    payload: take_payload(cur, header.flag)?,
                }
            }
        };

        Ok(message)
    }
}

fn ensure_len(frame_type: u8, min: usize, actual: usize) -> Result<(), ProtocolError> {
    if actual < min {
        return Err(ProtocolError::FrameTooShort {
            frame_type,
            min,
            actual,
        });
    }
    Ok(())
}

fn put_name(body: &mut BytesMut, name: &str) -> Result<(), ProtocolError> {
    let len = name.len();
    if len > u8::MAX as usize {
        return Err(ProtocolError::NameTooLong(len));
    }
    body.put_u8(len as u8);
    body.put_slice(name.as_bytes());
    Ok(())
}

/// Writes the (possibly deflated) payload and returns the deflate flag.
fn put_payload(body: &mut BytesMut, payload: &str) -> Result<bool, ProtocolError> {
    if payload.is_empty() {
        return Ok(false);
    }
    let (bytes, deflated) = maybe_deflate(payload.as_bytes())?;
    body.put_slice(&bytes);
    Ok(deflated)
}

fn take_name(frame_type: u8, cur: &mut &[u8]) -> Result<String, ProtocolError> {
    let len = cur.get_u8() as usize;
    if cur.len() < len {
        return Err(ProtocolError::FrameTooShort {
            frame_type,
            min: len,
            actual: cur.len(),
        });
    }
    let name = std::str::from_utf8(&cur[..len])
        .map_err(|_| ProtocolError::InvalidUtf8("name"))?
        .to_string();
    cur.advance(len);
    Ok(name)
}

fn take_payload(rest: &[u8], deflated: bool) -> Result<String, ProtocolError> {
    let bytes = maybe_inflate(rest, deflated)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8("payload"))
}
