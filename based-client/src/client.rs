//! High-level client API.

use crate::config::{ClientConfig, ConfigError};
use crate::connection::{self, ConnectionConfig, ConnectionHandle, ConnectionStatus, Target};
use crate::discovery::{Resolver, ServiceCoordinates};
use crate::engine::{ProtocolEngine, Transport};
use crate::error::ClientError;
use crate::listener::{DataResult, Listener, ObserveResult, Responder, SubId};
use based_protocol::RequestId;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Client for a based hub.
///
/// Operations never wait for the connection: frames are queued and sent
/// once it is open. `connect*` must be called from within a Tokio runtime.
pub struct Client {
    config: ClientConfig,
    engine: Arc<ProtocolEngine>,
    handle: ConnectionHandle,
    outbound: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    target: Mutex<Option<Target>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Client {
    /// Creates a new client with the given configuration.
    pub fn new(config: ClientConfig) -> Self {
        let (handle, outbound) = ConnectionHandle::new();
        let engine = Arc::new(ProtocolEngine::new(
            Arc::new(handle.clone()) as Arc<dyn Transport>
        ));
        Self {
            config,
            engine,
            handle,
            outbound: Arc::new(tokio::sync::Mutex::new(outbound)),
            target: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Creates a client from `BASED_CONFIG` and `BASED_*` variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = ClientConfig::load()?;
        config.validate()?;
        Ok(Self::new(config))
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Connects to the configured URL or discovery coordinates.
    pub fn connect(&self) -> Result<(), ClientError> {
        self.start(self.config.target())
    }

    /// Connects through discovery; reconnects re-resolve the coordinates.
    pub fn connect_to(&self, coords: ServiceCoordinates) -> Result<(), ClientError> {
        self.start(Target::Service(coords))
    }

    /// Connects to a literal `ws://` or `wss://` URL.
    pub fn connect_to_url(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let url = url.into();
        if !url.starts_with("ws://") && !url.starts_with("wss://") {
            return Err(ClientError::InvalidUrl(url));
        }
        self.start(Target::Url(url))
    }

    fn start(&self, target: Target) -> Result<(), ClientError> {
        let mut task = self.task.lock();
        if let Some(ref running) = *task {
            if !running.is_finished() {
                tracing::debug!("connect ignored, connection task already running");
                return Ok(());
            }
        }
        // Fail on a bad TLS setup here rather than inside the task.
        crate::tls::client_config(&self.config.tls)?;

        self.handle.reset();
        *self.target.lock() = Some(target.clone());
        let config: ConnectionConfig = self.config.connection_config(target);
        let handle = self.handle.clone();
        let engine = Arc::clone(&self.engine);
        let outbound = Arc::clone(&self.outbound);
        *task = Some(tokio::spawn(async move {
            if let Err(e) = connection::run(config, handle, engine, outbound).await {
                tracing::error!("connection stopped: {}", e);
            }
        }));
        Ok(())
    }

    /// Closes the connection and stops reconnecting. No-op unless open.
    pub fn disconnect(&self) -> bool {
        self.handle.disconnect()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.handle.status()
    }

    /// Resolves the current target to a URL without connecting. With `http`
    /// set, returns the hub's HTTP origin instead of its socket URL.
    pub async fn get_service(&self, http: bool) -> Result<String, ClientError> {
        let target = self
            .target
            .lock()
            .clone()
            .unwrap_or_else(|| self.config.target());
        let verify = match target {
            Target::Url(_) => true,
            Target::Service(ref coords) => coords.verify_status_tls,
        };
        let resolver = Resolver::new(verify, self.config.reconnect.clone())?;
        target.service_url(&resolver, http).await
    }

    /// Returns the protocol engine.
    pub fn engine(&self) -> &Arc<ProtocolEngine> {
        &self.engine
    }

    // =========================================================================
    // Observables
    // =========================================================================

    pub fn observe(
        &self,
        name: &str,
        payload: &str,
        listener: Listener<ObserveResult>,
    ) -> Result<SubId, ClientError> {
        self.engine.observe(name, payload, listener)
    }

    /// Observes into a channel; drop the receiver and call
    /// [`unobserve`](Self::unobserve) to stop.
    pub fn observe_stream(
        &self,
        name: &str,
        payload: &str,
    ) -> Result<(SubId, mpsc::UnboundedReceiver<ObserveResult>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self.engine.observe(name, payload, Listener::from_channel(tx))?;
        Ok((sub_id, rx))
    }

    pub fn unobserve(&self, sub_id: SubId) {
        self.engine.unobserve(sub_id)
    }

    pub fn get(
        &self,
        name: &str,
        payload: &str,
        responder: Responder<DataResult>,
    ) -> Result<SubId, ClientError> {
        self.engine.get(name, payload, responder)
    }

    /// Fetches the current value of an observable once.
    pub async fn get_async(&self, name: &str, payload: &str) -> Result<String, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.engine.get(name, payload, Responder::from_oneshot(tx))?;
        Self::wait(rx).await
    }

    // =========================================================================
    // Functions
    // =========================================================================

    pub fn call(
        &self,
        name: &str,
        payload: &str,
        responder: Responder<DataResult>,
    ) -> Result<RequestId, ClientError> {
        self.engine.call(name, payload, responder)
    }

    pub async fn call_async(&self, name: &str, payload: &str) -> Result<String, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.engine.call(name, payload, Responder::from_oneshot(tx))?;
        Self::wait(rx).await
    }

    // =========================================================================
    // Authentication
    // =========================================================================

    /// Sends a new auth state. Returns `false` while a previous negotiation
    /// is still in flight.
    pub fn set_auth_state(
        &self,
        state: &str,
        responder: Responder<String>,
    ) -> Result<bool, ClientError> {
        self.engine.set_auth_state(state, responder)
    }

    /// Sends a new auth state and waits for the state the server settled on.
    /// Returns `None` while a previous negotiation is still in flight.
    pub async fn set_auth_state_async(&self, state: &str) -> Result<Option<String>, ClientError> {
        let (tx, rx) = oneshot::channel();
        if !self.engine.set_auth_state(state, Responder::from_oneshot(tx))? {
            return Ok(None);
        }
        rx.await.map(Some).map_err(|_| ClientError::Canceled)
    }

    pub fn auth_state(&self) -> String {
        self.engine.auth_state()
    }

    // =========================================================================
    // Channels
    // =========================================================================

    pub fn channel_subscribe(
        &self,
        name: &str,
        payload: &str,
        listener: Listener<DataResult>,
    ) -> Result<SubId, ClientError> {
        self.engine.channel_subscribe(name, payload, listener)
    }

    pub fn channel_stream(
        &self,
        name: &str,
        payload: &str,
    ) -> Result<(SubId, mpsc::UnboundedReceiver<DataResult>), ClientError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let sub_id = self
            .engine
            .channel_subscribe(name, payload, Listener::from_channel(tx))?;
        Ok((sub_id, rx))
    }

    pub fn channel_unsubscribe(&self, sub_id: SubId) {
        self.engine.channel_unsubscribe(sub_id)
    }

    pub fn channel_publish(
        &self,
        name: &str,
        payload: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        self.engine.channel_publish(name, payload, message)
    }

    async fn wait(rx: oneshot::Receiver<DataResult>) -> Result<String, ClientError> {
        match rx.await {
            Ok(Ok(data)) => Ok(data),
            Ok(Err(error)) => Err(ClientError::Server(error)),
            Err(_) => Err(ClientError::Canceled),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
