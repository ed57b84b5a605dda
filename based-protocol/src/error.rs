//! Protocol error types and server error payloads.

use crate::{ObsId, RequestId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("incomplete frame header: need {needed} more bytes")]
    IncompleteHeader { needed: usize },

    #[error("frame type {frame_type} body too short: {actual} bytes (min {min})")]
    FrameTooShort {
        frame_type: u8,
        min: usize,
        actual: usize,
    },

    #[error("frame length {declared} exceeds buffer of {available} bytes")]
    TruncatedFrame { declared: usize, available: usize },

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("name too long: {0} bytes (max 255)")]
    NameTooLong(usize),

    #[error("request id {0:#x} does not fit in 24 bits")]
    RequestIdOutOfRange(u32),

    #[error("unknown message sub-type: {0}")]
    UnknownSubType(u8),

    #[error("deflate error: {0}")]
    Compression(std::io::Error),

    #[error("inflate error: {0}")]
    Decompression(std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
}

/// Error payload carried by a server error frame.
///
/// Exactly one of the id fields addresses the error; the raw JSON text is
/// kept so listeners receive what the server sent. `code` and `message` are
/// informational and accept any JSON value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    /// Id of a failed call, or the observable id of a failed get.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observable_id: Option<ObsId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<ObsId>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,

    #[serde(skip)]
    pub raw: String,
}

impl ErrorPayload {
    /// Parses an error payload from the JSON text of an error frame.
    ///
    /// An empty body is treated as `{}`.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let text = if text.is_empty() { "{}" } else { text };
        let mut payload: ErrorPayload = serde_json::from_str(text)?;
        payload.raw = text.to_string();
        Ok(payload)
    }

    /// Creates a payload addressed to a function call.
    pub fn for_request(request_id: RequestId, message: impl Into<String>) -> Self {
        Self::build(Some(u64::from(request_id)), None, None, message.into())
    }

    /// Creates a payload addressed to the pending gets of an observable.
    pub fn for_get(observable_id: ObsId, message: impl Into<String>) -> Self {
        Self::build(Some(observable_id), None, None, message.into())
    }

    /// Creates a payload addressed to an observable.
    pub fn for_observable(observable_id: ObsId, message: impl Into<String>) -> Self {
        Self::build(None, Some(observable_id), None, message.into())
    }

    /// Creates a payload addressed to a channel.
    pub fn for_channel(channel_id: ObsId, message: impl Into<String>) -> Self {
        Self::build(None, None, Some(channel_id), message.into())
    }

    fn build(
        request_id: Option<u64>,
        observable_id: Option<ObsId>,
        channel_id: Option<ObsId>,
        message: String,
    ) -> Self {
        let mut payload = Self {
            request_id,
            observable_id,
            channel_id,
            code: None,
            message: Some(Value::String(message)),
            raw: String::new(),
        };
        payload.raw = serde_json::to_string(&payload).unwrap_or_else(|_| "{}".to_string());
        payload
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match &self.message {
            Some(Value::String(text)) => text.clone(),
            Some(other) => other.to_string(),
            None => return write!(f, "{}", self.raw),
        };
        match &self.code {
            Some(Value::String(code)) => write!(f, "[{}] {}", code, message),
            Some(code) => write!(f, "[{}] {}", code, message),
            None => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for ErrorPayload {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_request_error() {
        let payload = ErrorPayload::parse(r#"{"requestId":12,"code":40001,"message":"boom"}"#)
            .unwrap();
        assert_eq!(payload.request_id, Some(12));
        assert_eq!(payload.observable_id, None);
        assert_eq!(payload.code, Some(Value::from(40001)));
        assert_eq!(payload.to_string(), "[40001] boom");
        assert!(payload.raw.contains("boom"));
    }

    #[test]
    fn test_parse_large_observable_id() {
        let payload = ErrorPayload::parse(r#"{"observableId":18446744073709551615}"#).unwrap();
        assert_eq!(payload.observable_id, Some(u64::MAX));
    }

    #[test]
    fn test_parse_get_error_with_observable_id() {
        let payload = ErrorPayload::parse(r#"{"requestId":18446744073709551615,"message":"x"}"#)
            .unwrap();
        assert_eq!(payload.request_id, Some(u64::MAX));
        assert_eq!(ErrorPayload::for_get(u64::MAX, "x").request_id, Some(u64::MAX));
    }

    #[test]
    fn test_parse_empty_body() {
        let payload = ErrorPayload::parse("").unwrap();
        assert_eq!(payload.raw, "{}");
        assert!(payload.request_id.is_none());
        assert!(payload.observable_id.is_none());
        assert!(payload.channel_id.is_none());
    }

    #[test]
    fn test_parse_invalid_json() {
        assert!(matches!(
            ErrorPayload::parse("not json"),
            Err(ProtocolError::Json(_))
        ));
    }

    #[test]
    fn test_constructors_fill_raw() {
        let payload = ErrorPayload::for_channel(7, "gone");
        let reparsed = ErrorPayload::parse(&payload.raw).unwrap();
        assert_eq!(reparsed.channel_id, Some(7));
        assert_eq!(reparsed.message, Some(Value::from("gone")));
    }

    #[test]
    fn test_parse_loose_code_and_message() {
        let payload = ErrorPayload::parse(
            r#"{"requestId":3,"code":"E_AUTH","message":{"reason":"expired"},"statusCode":401}"#,
        )
        .unwrap();
        assert_eq!(payload.request_id, Some(3));
        assert_eq!(payload.code, Some(Value::from("E_AUTH")));
        assert_eq!(payload.to_string(), r#"[E_AUTH] {"reason":"expired"}"#);

        let payload = ErrorPayload::parse(r#"{"observableId":9,"code":null}"#).unwrap();
        assert_eq!(payload.observable_id, Some(9));
        assert_eq!(payload.to_string(), r#"{"observableId":9,"code":null}"#);
    }

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::FrameTooShort {
            frame_type: 2,
            min: 24,
            actual: 3,
        };
        assert!(err.to_string().contains("24"));

        let err = ProtocolError::NameTooLong(300);
        assert!(err.to_string().contains("300"));

        let err = ProtocolError::RequestIdOutOfRange(0x0100_0000);
        assert!(err.to_string().contains("1000000"));

        let err = ProtocolError::InvalidUtf8("error payload");
        assert!(err.to_string().contains("UTF-8"));
    }
}
