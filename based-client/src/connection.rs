//! Connection management.
//!
//! A background task owns the websocket. It resolves the target, connects,
//! pumps frames between the socket and the [`ProtocolEngine`], and
//! reconnects with a linear backoff until the user disconnects.

use crate::discovery::{encode_uri_component, Resolver, ServiceCoordinates};
use crate::engine::{ProtocolEngine, Transport};
use crate::error::ClientError;
use crate::tls::TlsClientConfig;
use based_protocol::{ClientMessage, Decoder};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async_tls_with_config, Connector, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Closed,
    Connecting,
    Open,
    Failed,
    /// Closed by [`ConnectionHandle::disconnect`]; never reconnects.
    TerminatedByUser,
}

/// Linear reconnect backoff: `min(attempts * step, max)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub step_ms: u64,
    pub max_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            step_ms: 100,
            max_ms: 1500,
        }
    }
}

impl ReconnectConfig {
    pub fn delay(&self, attempts: u32) -> Duration {
        let ms = (attempts as u64).saturating_mul(self.step_ms);
        Duration::from_millis(ms.min(self.max_ms))
    }
}

/// What to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Literal `ws://` or `wss://` URL, reused on every reconnect.
    Url(String),
    /// Coordinates re-resolved through discovery on every reconnect.
    Service(ServiceCoordinates),
}

impl Target {
    /// Socket URL for this target, or the HTTP origin when `http` is set.
    pub async fn service_url(&self, resolver: &Resolver, http: bool) -> Result<String, ClientError> {
        match self {
            Target::Url(url) if http => Ok(http_origin(url)),
            Target::Url(url) => Ok(url.clone()),
            Target::Service(coords) => {
                let endpoint = resolver.resolve(coords).await?;
                Ok(endpoint.url(coords.tls, http))
            }
        }
    }

    fn verify_status_tls(&self) -> bool {
        match self {
            Target::Url(_) => true,
            Target::Service(coords) => coords.verify_status_tls,
        }
    }
}

fn http_origin(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("wss://") {
        format!("https://{}", rest)
    } else if let Some(rest) = url.strip_prefix("ws://") {
        format!("http://{}", rest)
    } else {
        url.to_string()
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub target: Target,
    pub reconnect: ReconnectConfig,
    pub tls: TlsClientConfig,
}

impl ConnectionConfig {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            reconnect: ReconnectConfig::default(),
            tls: TlsClientConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }
}

struct Shared {
    status: Mutex<ConnectionStatus>,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: Notify,
}

/// Engine-facing side of the connection: current status plus a queue of
/// outbound frame batches consumed by the connection task.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Bytes>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(Shared {
                status: Mutex::new(ConnectionStatus::Closed),
                outbound: tx,
                shutdown: Notify::new(),
            }),
        };
        (handle, rx)
    }

    /// Moves to `TerminatedByUser` and closes the socket. No-op unless open.
    pub fn disconnect(&self) -> bool {
        {
            let mut status = self.shared.status.lock();
            if *status != ConnectionStatus::Open {
                tracing::debug!("disconnect ignored in state {:?}", *status);
                return false;
            }
            *status = ConnectionStatus::TerminatedByUser;
        }
        tracing::info!("disconnecting");
        self.shared.shutdown.notify_one();
        true
    }

    /// Resets a terminated handle so a new connection task can run.
    pub(crate) fn reset(&self) {
        *self.shared.status.lock() = ConnectionStatus::Closed;
    }

    /// Changes the status unless the user terminated the connection.
    fn transition(&self, to: ConnectionStatus) -> bool {
        let mut status = self.shared.status.lock();
        if *status == ConnectionStatus::TerminatedByUser {
            return false;
        }
        if *status != to {
            tracing::debug!("connection {:?} -> {:?}", *status, to);
            *status = to;
        }
        true
    }

    fn is_terminated(&self) -> bool {
        *self.shared.status.lock() == ConnectionStatus::TerminatedByUser
    }
}

impl Transport for ConnectionHandle {
    fn status(&self) -> ConnectionStatus {
        *self.shared.status.lock()
    }

    fn send(&self, frames: Bytes) -> Result<(), ClientError> {
        self.shared
            .outbound
            .send(frames)
            .map_err(|_| ClientError::ConnectionClosed)
    }
}

/// How a session ended.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Terminated,
    Closed,
    Failed,
}

/// Drives the connection until the user disconnects or a non-retryable
/// error occurs.
pub async fn run(
    config: ConnectionConfig,
    handle: ConnectionHandle,
    engine: Arc<ProtocolEngine>,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>>,
) -> Result<(), ClientError> {
    let mut outbound = outbound.lock().await;
    let connector = Connector::Rustls(crate::tls::client_config(&config.tls)?);
    let resolver = Resolver::new(config.target.verify_status_tls(), config.reconnect.clone())?;
    let mut attempts: u32 = 0;

    loop {
        if attempts > 0 {
            let delay = config.reconnect.delay(attempts);
            tracing::debug!("reconnecting in {:?} (attempt {})", delay, attempts);
            tokio::time::sleep(delay).await;
        }
        if !handle.transition(ConnectionStatus::Connecting) {
            return Ok(());
        }

        let url = match config.target.service_url(&resolver, false).await {
            Ok(url) => url,
            Err(e) => {
                handle.transition(ConnectionStatus::Failed);
                return Err(e);
            }
        };

        let socket = match connect(&url, &engine.auth_state(), connector.clone()).await {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!("connecting to {} failed: {}", url, e);
                handle.transition(ConnectionStatus::Failed);
                if !e.is_retryable() {
                    return Err(e);
                }
                attempts = attempts.saturating_add(1);
                continue;
            }
        };

        tracing::info!("connected to {}", url);
        attempts = 0;
        match session(socket, &handle, &engine, &mut outbound).await {
            SessionEnd::Terminated => return Ok(()),
            SessionEnd::Closed => {
                handle.transition(ConnectionStatus::Closed);
            }
            SessionEnd::Failed => {
                handle.transition(ConnectionStatus::Failed);
            }
        }
        if handle.is_terminated() {
            return Ok(());
        }
        attempts = 1;
    }
}

async fn connect(url: &str, auth_state: &str, connector: Connector) -> Result<Socket, ClientError> {
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::InvalidUrl(format!("{}: {}", url, e)))?;
    let protocol = if auth_state.is_empty() {
        HeaderValue::from_static("{}")
    } else {
        HeaderValue::from_str(&encode_uri_component(auth_state))
            .map_err(|e| ClientError::InvalidUrl(e.to_string()))?
    };
    request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, protocol);

    let (socket, _) = connect_async_tls_with_config(request, None, false, Some(connector)).await?;
    Ok(socket)
}

async fn session(
    socket: Socket,
    handle: &ConnectionHandle,
    engine: &ProtocolEngine,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
) -> SessionEnd {
    // Batches handed over while the previous socket was dying never reached
    // the server.
    let mut stale = Vec::new();
    while let Ok(batch) = outbound.try_recv() {
        stale.push(batch);
    }
    let carried = carry_over(stale);

    let mut opened = false;
    engine.on_open(|| opened = handle.transition(ConnectionStatus::Open));
    if !opened {
        return SessionEnd::Terminated;
    }
    if let Some(frames) = carried {
        tracing::debug!("resending {} bytes from the previous session", frames.len());
        if let Err(e) = handle.send(frames) {
            tracing::warn!("failed to resend frames: {}", e);
        }
    }

    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            _ = handle.shared.shutdown.notified() => {
                // A permit left over from an earlier session.
                if !handle.is_terminated() {
                    continue;
                }
                let _ = sink.send(Message::Close(None)).await;
                return SessionEnd::Terminated;
            }
            frames = outbound.recv() => {
                let Some(frames) = frames else {
                    return SessionEnd::Terminated;
                };
                tracing::debug!("sending {} bytes", frames.len());
                if let Err(e) = sink.send(Message::Binary(frames)).await {
                    tracing::warn!("write failed: {}", e);
                    return SessionEnd::Failed;
                }
            }
            message = stream.next() => match message {
                Some(Ok(Message::Binary(data))) => engine.on_message(&data),
                Some(Ok(Message::Ping(payload))) => {
                    let _ = sink.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Text(text))) => {
                    tracing::debug!("ignoring text message ({} bytes)", text.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!("server closed the connection: {:?}", frame);
                    return SessionEnd::Closed;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Err(e)) => {
                    tracing::warn!("read failed: {}", e);
                    return SessionEnd::Failed;
                }
                None => return SessionEnd::Closed,
            }
        }
    }
}

/// Frames from unsent batches that still have to go out on a new session.
///
/// Subscription frames are dropped: a new session starts with no
/// server-side subscriptions and `on_open` re-announces the active ones.
/// Republish announcements are kept.
fn carry_over(batches: Vec<Bytes>) -> Option<Bytes> {
    let mut kept = BytesMut::new();
    let mut dropped = 0usize;

    for batch in batches {
        let mut decoder = Decoder::new();
        decoder.extend_bytes(batch);
        loop {
            match decoder.decode_client() {
                Ok(Some(message)) if is_session_bound(&message) => dropped += 1,
                Ok(Some(message)) => {
                    if let Err(e) = message.encode_into(&mut kept) {
                        tracing::warn!("dropping unsent {:?} frame: {}", message.frame_type(), e);
                    }
                }
                Ok(None) => break,
                Err(e) => tracing::warn!("dropping unsent malformed frame: {}", e),
            }
        }
        if let Err(e) = decoder.finish() {
            tracing::warn!("dropping unsent trailing bytes: {}", e);
        }
    }

    if dropped > 0 {
        tracing::debug!("dropped {} unsent subscription frames", dropped);
    }
    (!kept.is_empty()).then(|| kept.freeze())
}

fn is_session_bound(message: &ClientMessage) -> bool {
    matches!(
        message,
        ClientMessage::Observe { .. }
            | ClientMessage::Unobserve { .. }
            | ClientMessage::ChannelSubscribe {
                republish: false,
                ..
            }
            | ClientMessage::ChannelUnsubscribe { .. }
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use based_protocol::Encoder;

    fn decode_all(bytes: &Bytes) -> Vec<ClientMessage> {
        let mut decoder = Decoder::new();
        decoder.extend(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode_client().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn test_carry_over_keeps_requests() {
        let call = ClientMessage::Function {
            request_id: 4,
            name: "hello".to_string(),
            payload: "{}".to_string(),
        };
        let get = ClientMessage::Get {
            id: 9,
            checksum: 3,
            name: "item".to_string(),
            payload: String::new(),
        };
        let auth = ClientMessage::Auth {
            state: "{\"token\":\"t\"}".to_string(),
        };
        let republish = ClientMessage::ChannelSubscribe {
            id: 5,
            name: "events".to_string(),
            payload: String::new(),
            republish: true,
        };
        let first = Encoder::encode_client_batch([
            &auth,
            &ClientMessage::ChannelSubscribe {
                id: 6,
                name: "chat".to_string(),
                payload: String::new(),
                republish: false,
            },
            &ClientMessage::Observe {
                id: 1,
                checksum: 0,
                name: "q".to_string(),
                payload: String::new(),
            },
            &call,
        ])
        .unwrap()
        .freeze();
        let second = Encoder::encode_client_batch([
            &ClientMessage::Unobserve { id: 1 },
            &ClientMessage::ChannelUnsubscribe { id: 6 },
            &republish,
            &get,
        ])
        .unwrap()
        .freeze();

        let kept = carry_over(vec![first, second]).unwrap();
        assert_eq!(decode_all(&kept), vec![auth, call, republish, get]);
    }

    #[test]
    fn test_carry_over_nothing_left() {
        assert!(carry_over(Vec::new()).is_none());
        let only_observe = Encoder::encode_client(&ClientMessage::Observe {
            id: 1,
            checksum: 0,
            name: "q".to_string(),
            payload: String::new(),
        })
        .unwrap()
        .freeze();
        assert!(carry_over(vec![only_observe]).is_none());
    }

    #[test]
    fn test_unsent_call_survives_reconnect() {
        let (handle, mut rx) = ConnectionHandle::new();
        let engine = ProtocolEngine::new(Arc::new(handle.clone()) as Arc<dyn Transport>);
        handle.transition(ConnectionStatus::Open);

        engine
            .observe("q", "", crate::listener::Listener::new(|_| {}))
            .unwrap();
        let (tx, _reply) = tokio::sync::oneshot::channel();
        engine
            .call("hello", "{}", crate::listener::Responder::from_oneshot(tx))
            .unwrap();

        // The socket died before either batch was written.
        handle.transition(ConnectionStatus::Failed);
        let mut stale = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            stale.push(batch);
        }
        let carried = carry_over(stale).unwrap();

        engine.on_open(|| {
            handle.transition(ConnectionStatus::Open);
        });
        handle.send(carried).unwrap();

        let mut frames = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            frames.extend(decode_all(&batch));
        }
        assert_eq!(frames.len(), 2);
        assert!(matches!(&frames[0], ClientMessage::Observe { checksum: 0, name, .. } if name == "q"));
        assert!(matches!(&frames[1], ClientMessage::Function { name, .. } if name == "hello"));
    }

    #[test]
    fn test_backoff() {
        let reconnect = ReconnectConfig::default();
        assert_eq!(reconnect.delay(0), Duration::ZERO);
        assert_eq!(reconnect.delay(1), Duration::from_millis(100));
        assert_eq!(reconnect.delay(7), Duration::from_millis(700));
        assert_eq!(reconnect.delay(15), Duration::from_millis(1500));
        assert_eq!(reconnect.delay(1000), Duration::from_millis(1500));
        assert_eq!(reconnect.delay(u32::MAX), Duration::from_millis(1500));
    }

    #[test]
    fn test_disconnect_only_when_open() {
        let (handle, _rx) = ConnectionHandle::new();
        assert!(!handle.disconnect());
        assert_eq!(handle.status(), ConnectionStatus::Closed);

        handle.transition(ConnectionStatus::Open);
        assert!(handle.disconnect());
        assert_eq!(handle.status(), ConnectionStatus::TerminatedByUser);

        assert!(!handle.transition(ConnectionStatus::Connecting));
        assert!(!handle.disconnect());
        assert_eq!(handle.status(), ConnectionStatus::TerminatedByUser);

        handle.reset();
        assert_eq!(handle.status(), ConnectionStatus::Closed);
    }

    #[tokio::test]
    async fn test_send_goes_to_receiver() {
        let (handle, mut rx) = ConnectionHandle::new();
        handle.send(Bytes::from_static(b"abc")).unwrap();
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"abc"));

        drop(rx);
        assert!(matches!(
            handle.send(Bytes::new()),
            Err(ClientError::ConnectionClosed)
        ));
    }

    #[test]
    fn test_http_origin() {
        assert_eq!(http_origin("wss://hub.based.dev/key"), "https://hub.based.dev/key");
        assert_eq!(http_origin("ws://localhost:9000"), "http://localhost:9000");
        assert_eq!(http_origin("https://x"), "https://x");
    }

    #[tokio::test]
    async fn test_url_target_skips_discovery() {
        let resolver = Resolver::new(true, ReconnectConfig::default()).unwrap();
        let target = Target::Url("wss://hub.example/abc".to_string());
        assert_eq!(
            target.service_url(&resolver, false).await.unwrap(),
            "wss://hub.example/abc"
        );
        assert_eq!(
            target.service_url(&resolver, true).await.unwrap(),
            "https://hub.example/abc"
        );
    }
}
