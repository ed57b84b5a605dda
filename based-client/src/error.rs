//! Client error types.

use based_protocol::ObsId;
use thiserror::Error;

/// Client errors.
///
/// Server-signaled errors never show up here: they are delivered to the
/// listener of the affected call, observable or channel.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] based_protocol::ProtocolError),

    #[error("id {id:#018x} already belongs to {existing}")]
    IdCollision { id: ObsId, existing: String },

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("discovery request failed: {0}")]
    Discovery(#[from] reqwest::Error),

    #[error("discovery response carried no endpoint")]
    NoEndpoint,

    #[error("service {0} cannot be discovered")]
    UndiscoverableService(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("request was dropped before a reply arrived")]
    Canceled,

    #[error("server error: {0}")]
    Server(based_protocol::ErrorPayload),
}

impl ClientError {
    /// Returns whether retrying the failed step can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::NotConnected
            | ClientError::ConnectionClosed
            | ClientError::WebSocket(_)
            | ClientError::Discovery(_)
            | ClientError::NoEndpoint => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use based_protocol::ErrorPayload;

    #[test]
    fn test_retryable() {
        assert!(ClientError::NoEndpoint.is_retryable());
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(!ClientError::UndiscoverableService("x".into()).is_retryable());
        assert!(!ClientError::Server(ErrorPayload::for_request(1, "no")).is_retryable());
        assert!(!ClientError::IdCollision {
            id: 1,
            existing: "a".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ClientError::IdCollision {
            id: 255,
            existing: "counter".into(),
        };
        let text = err.to_string();
        assert!(text.contains("0x00000000000000ff"));
        assert!(text.contains("counter"));

        let err = ClientError::Server(ErrorPayload::for_request(3, "bad input"));
        assert_eq!(err.to_string(), "server error: bad input");
    }
}
