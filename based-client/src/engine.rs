//! Protocol engine: registries, outbound queues and inbound frame routing.
//!
//! All state sits behind one mutex. Operations queue frames and drain them
//! to the [`Transport`] when it is open; inbound frames are routed to the
//! registries, and the resulting listener calls run after the lock is
//! released.

use crate::channels::ChannelRegistry;
use crate::connection::ConnectionStatus;
use crate::error::ClientError;
use crate::listener::{
    dispatch, DataResult, Listener, Notification, ObserveResult, Responder, SubId,
};
use crate::queue::{OutboundQueue, QueueKind};
use crate::registry::{DiffOutcome, GetOutcome, ObserveOutcome, Query, Refetch, SubscriptionRegistry};
use crate::requests::{AuthState, RequestRegistry};
use based_protocol::{obs_id, ClientMessage, Decoder, ErrorPayload, ObsId, RequestId, ServerMessage};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outbound side of a connection as seen by the engine.
pub trait Transport: Send + Sync {
    fn status(&self) -> ConnectionStatus;

    /// Hands a batch of concatenated frames to the connection.
    fn send(&self, frames: Bytes) -> Result<(), ClientError>;
}

struct EngineState {
    subscriptions: SubscriptionRegistry,
    channels: ChannelRegistry,
    requests: RequestRegistry,
    auth: AuthState,
    queue: OutboundQueue,
    next_sub_id: SubId,
}

impl EngineState {
    fn new() -> Self {
        Self {
            subscriptions: SubscriptionRegistry::new(),
            channels: ChannelRegistry::new(),
            requests: RequestRegistry::new(),
            auth: AuthState::new(),
            queue: OutboundQueue::new(),
            next_sub_id: 0,
        }
    }

    fn alloc_sub_id(&mut self) -> SubId {
        let id = self.next_sub_id;
        self.next_sub_id = self.next_sub_id.wrapping_add(1);
        id
    }

    fn enqueue(&mut self, kind: QueueKind, message: &ClientMessage) -> Result<(), ClientError> {
        let frame = message.encode()?;
        self.queue.push(kind, frame);
        Ok(())
    }

    /// Queues a frame whose encoding cannot fail in practice.
    fn enqueue_logged(&mut self, kind: QueueKind, message: &ClientMessage) {
        if let Err(e) = self.enqueue(kind, message) {
            tracing::error!("failed to encode {:?} frame: {}", kind, e);
        }
    }

    /// Queues an unsubscribe frame that a later re-subscribe can withdraw.
    fn enqueue_unsubscribe(&mut self, kind: QueueKind, id: ObsId, message: &ClientMessage) {
        match message.encode() {
            Ok(frame) => self.queue.push_for(kind, id, frame),
            Err(e) => tracing::error!("failed to encode {:?} frame: {}", kind, e),
        }
    }

    /// Withdraws unsent unsubscribe frames for an id that is active again.
    /// Left queued they would drain after the new subscribe frame.
    fn withdraw_unsubscribe(&mut self, kind: QueueKind, id: ObsId) {
        let removed = self.queue.remove_for(kind, id);
        if removed > 0 {
            tracing::debug!("withdrew {} queued {:?} frames for {:#x}", removed, kind, id);
        }
    }
}

pub struct ProtocolEngine {
    transport: Arc<dyn Transport>,
    state: Mutex<EngineState>,
}

impl ProtocolEngine {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            state: Mutex::new(EngineState::new()),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    /// Subscribes to an observable. Only the first subscriber of a given
    /// (name, payload) sends an observe frame.
    pub fn observe(
        &self,
        name: &str,
        payload: &str,
        listener: Listener<ObserveResult>,
    ) -> Result<SubId, ClientError> {
        let query = Query::new(name, payload);
        let id = obs_id(name, payload);

        let mut state = self.state.lock();
        state.subscriptions.check(id, &query)?;
        let sub_id = state.alloc_sub_id();

        let outcome = state
            .subscriptions
            .observe(id, query.clone(), sub_id, listener);
        if let ObserveOutcome::Created { checksum } = outcome {
            let message = ClientMessage::Observe {
                id,
                checksum,
                name: query.name,
                payload: query.payload,
            };
            if let Err(e) = state.enqueue(QueueKind::Observe, &message) {
                state.subscriptions.unobserve(sub_id);
                return Err(e);
            }
            state.withdraw_unsubscribe(QueueKind::Unobserve, id);
            tracing::debug!("observe {} -> {:#x} (checksum {})", name, id, checksum);
        }

        self.drain(&mut state);
        Ok(sub_id)
    }

    /// Requests the current value once. If the observable is active, the
    /// next update answers the get and no frame is sent.
    pub fn get(
        &self,
        name: &str,
        payload: &str,
        responder: Responder<DataResult>,
    ) -> Result<SubId, ClientError> {
        let query = Query::new(name, payload);
        let id = obs_id(name, payload);

        let mut state = self.state.lock();
        state.subscriptions.check(id, &query)?;
        let sub_id = state.alloc_sub_id();

        let outcome = state.subscriptions.get(id, query.clone(), sub_id, responder);
        if let GetOutcome::Request { checksum } = outcome {
            let message = ClientMessage::Get {
                id,
                checksum,
                name: query.name,
                payload: query.payload,
            };
            if let Err(e) = state.enqueue(QueueKind::Get, &message) {
                state.subscriptions.cancel_get(id, sub_id);
                return Err(e);
            }
            self.drain(&mut state);
        }

        Ok(sub_id)
    }

    /// Removes a subscription; the last one queues an unobserve frame.
    pub fn unobserve(&self, sub_id: SubId) {
        let mut state = self.state.lock();
        match state.subscriptions.unobserve(sub_id) {
            Some(id) => {
                tracing::debug!("unobserve {:#x}", id);
                state.enqueue_unsubscribe(
                    QueueKind::Unobserve,
                    id,
                    &ClientMessage::Unobserve { id },
                );
                self.drain(&mut state);
            }
            None => tracing::debug!("no observable subscription {}", sub_id),
        }
    }

    /// Calls a server function.
    pub fn call(
        &self,
        name: &str,
        payload: &str,
        responder: Responder<DataResult>,
    ) -> Result<RequestId, ClientError> {
        let mut state = self.state.lock();
        let request_id = state.requests.next_id();
        let message = ClientMessage::Function {
            request_id,
            name: name.to_string(),
            payload: payload.to_string(),
        };
        state.enqueue(QueueKind::Function, &message)?;
        state.requests.register(request_id, responder);
        self.drain(&mut state);
        Ok(request_id)
    }

    /// Starts an auth negotiation. Returns `false` without sending anything
    /// while another negotiation is in flight.
    pub fn set_auth_state(
        &self,
        auth: &str,
        responder: Responder<String>,
    ) -> Result<bool, ClientError> {
        let mut state = self.state.lock();
        if state.auth.in_flight() {
            tracing::debug!("auth negotiation already in flight");
            return Ok(false);
        }
        let frame = ClientMessage::Auth {
            state: auth.to_string(),
        }
        .encode()?;
        state.auth.begin(auth.to_string(), responder);
        state.queue.set_auth(frame);
        self.drain(&mut state);
        Ok(true)
    }

    pub fn auth_state(&self) -> String {
        self.state.lock().auth.current().to_string()
    }

    pub fn channel_subscribe(
        &self,
        name: &str,
        payload: &str,
        listener: Listener<DataResult>,
    ) -> Result<SubId, ClientError> {
        let query = Query::new(name, payload);
        let id = obs_id(name, payload);

        let mut state = self.state.lock();
        state.channels.check(id, &query)?;
        let sub_id = state.alloc_sub_id();

        if state.channels.subscribe(id, query.clone(), sub_id, listener) {
            let message = ClientMessage::ChannelSubscribe {
                id,
                name: query.name,
                payload: query.payload,
                republish: false,
            };
            if let Err(e) = state.enqueue(QueueKind::ChannelSubscribe, &message) {
                state.channels.unsubscribe(sub_id);
                return Err(e);
            }
            state.withdraw_unsubscribe(QueueKind::ChannelUnsubscribe, id);
            tracing::debug!("channel subscribe {} -> {:#x}", name, id);
        }

        self.drain(&mut state);
        Ok(sub_id)
    }

    pub fn channel_unsubscribe(&self, sub_id: SubId) {
        let mut state = self.state.lock();
        match state.channels.unsubscribe(sub_id) {
            Some(id) => {
                tracing::debug!("channel unsubscribe {:#x}", id);
                state.enqueue_unsubscribe(
                    QueueKind::ChannelUnsubscribe,
                    id,
                    &ClientMessage::ChannelUnsubscribe { id },
                );
                self.drain(&mut state);
            }
            None => tracing::debug!("no channel subscription {}", sub_id),
        }
    }

    /// Publishes a message and remembers the channel for republish requests.
    pub fn channel_publish(
        &self,
        name: &str,
        payload: &str,
        message: &str,
    ) -> Result<(), ClientError> {
        let query = Query::new(name, payload);
        let id = obs_id(name, payload);

        let mut state = self.state.lock();
        state.channels.check(id, &query)?;
        state.enqueue(
            QueueKind::ChannelPublish,
            &ClientMessage::ChannelPublish {
                id,
                payload: message.to_string(),
            },
        )?;
        state.channels.register_publisher(id, query);
        self.drain(&mut state);
        Ok(())
    }

    /// Re-announces every active observable (checksum 0) and channel, then
    /// drains. `mark_open` runs under the engine lock so no other frame can
    /// slip in ahead of the re-announcements.
    pub fn on_open(&self, mark_open: impl FnOnce()) {
        let mut state = self.state.lock();
        mark_open();

        let observes: Vec<ClientMessage> = state
            .subscriptions
            .active()
            .map(|(id, query)| ClientMessage::Observe {
                id,
                checksum: 0,
                name: query.name.clone(),
                payload: query.payload.clone(),
            })
            .collect();
        let channels: Vec<ClientMessage> = state
            .channels
            .active()
            .map(|(id, query)| ClientMessage::ChannelSubscribe {
                id,
                name: query.name.clone(),
                payload: query.payload.clone(),
                republish: false,
            })
            .collect();

        state.queue.clear(QueueKind::Observe);
        state.queue.clear(QueueKind::ChannelSubscribe);
        for message in &observes {
            state.enqueue_logged(QueueKind::Observe, message);
        }
        for message in &channels {
            state.enqueue_logged(QueueKind::ChannelSubscribe, message);
        }

        tracing::info!(
            "connection open, resubscribing {} observables and {} channels",
            observes.len(),
            channels.len()
        );
        self.drain(&mut state);
    }

    /// Handles one transport message, which may carry several frames.
    pub fn on_message(&self, data: &[u8]) {
        let mut decoder = Decoder::new();
        decoder.extend(data);

        let mut notifications = Vec::new();
        {
            let mut state = self.state.lock();
            loop {
                match decoder.decode_server() {
                    Ok(Some(message)) => {
                        self.handle_message(&mut state, message, &mut notifications)
                    }
                    Ok(None) => break,
                    Err(e) => tracing::warn!("dropping malformed frame: {}", e),
                }
            }
            if let Err(e) = decoder.finish() {
                tracing::warn!("dropping trailing bytes: {}", e);
            }
            self.drain(&mut state);
        }

        dispatch(notifications);
    }

    /// Number of frames waiting in one queue.
    pub fn queued(&self, kind: QueueKind) -> usize {
        self.state.lock().queue.len(kind)
    }

    /// Number of observables with at least one subscription.
    pub fn active_observables(&self) -> usize {
        self.state.lock().subscriptions.active_count()
    }

    fn handle_message(
        &self,
        state: &mut EngineState,
        message: ServerMessage,
        out: &mut Vec<Notification>,
    ) {
        match message {
            ServerMessage::FunctionData {
                request_id,
                payload,
            } => out.extend(state.requests.resolve(request_id, payload)),
            ServerMessage::SubscriptionData {
                id,
                checksum,
                payload,
            } => out.extend(state.subscriptions.apply_data(id, checksum, payload)),
            ServerMessage::SubscriptionDiff {
                id,
                checksum,
                prev_checksum,
                patch,
            } => match state
                .subscriptions
                .apply_diff(id, checksum, prev_checksum, &patch)
            {
                DiffOutcome::Applied(notifications) => out.extend(notifications),
                DiffOutcome::Refetch(refetch) => Self::refetch(state, id, refetch),
            },
            ServerMessage::GetUnchanged { id } => out.extend(state.subscriptions.get_unchanged(id)),
            ServerMessage::Auth { payload } => out.extend(state.auth.resolve(payload)),
            ServerMessage::Error(error) => Self::route_error(state, error, out),
            ServerMessage::ChannelRepublish { id } => match state.channels.publisher(id).cloned() {
                Some(query) => {
                    tracing::debug!("republishing channel {:#x}", id);
                    state.enqueue_logged(
                        QueueKind::ChannelSubscribe,
                        &ClientMessage::ChannelSubscribe {
                            id,
                            name: query.name,
                            payload: query.payload,
                            republish: true,
                        },
                    );
                }
                None => tracing::warn!("republish request for unknown channel {:#x}", id),
            },
            ServerMessage::ChannelMessage { id, payload } => {
                out.extend(state.channels.deliver(id, &payload))
            }
        }
    }

    fn refetch(state: &mut EngineState, id: ObsId, refetch: Refetch) {
        match refetch {
            Refetch::Observe(query) => state.enqueue_logged(
                QueueKind::Observe,
                &ClientMessage::Observe {
                    id,
                    checksum: 0,
                    name: query.name,
                    payload: query.payload,
                },
            ),
            Refetch::Get(query) => state.enqueue_logged(
                QueueKind::Get,
                &ClientMessage::Get {
                    id,
                    checksum: 0,
                    name: query.name,
                    payload: query.payload,
                },
            ),
            Refetch::Nothing => tracing::debug!("dropping diff for inactive {:#x}", id),
        }
    }

    fn route_error(state: &mut EngineState, error: ErrorPayload, out: &mut Vec<Notification>) {
        if let Some(id) = error.request_id {
            if let Ok(request_id) = RequestId::try_from(id) {
                out.extend(state.requests.fail(request_id, &error));
            }
            out.extend(state.subscriptions.fail_gets(id, &error));
        } else if let Some(id) = error.observable_id {
            tracing::debug!("observable {:#x} failed: {}", id, error);
            out.extend(state.subscriptions.fail_observable(id, &error));
        } else if let Some(id) = error.channel_id {
            tracing::debug!("channel {:#x} failed: {}", id, error);
            out.extend(state.channels.fail(id, &error));
        } else {
            tracing::warn!("error frame without target: {}", error.raw);
        }
    }

    fn drain(&self, state: &mut EngineState) {
        if self.transport.status() != ConnectionStatus::Open {
            return;
        }
        let Some(frames) = state.queue.snapshot() else {
            return;
        };
        let len = frames.len();
        match self.transport.send(frames) {
            Ok(()) => {
                tracing::debug!("drained {} bytes", len);
                state.queue.clear_all();
            }
            Err(e) => tracing::debug!("drain deferred: {}", e),
        }
    }
}
