//! Function call registry and authentication state.

use crate::listener::{DataResult, Notification, Responder};
use based_protocol::{ErrorPayload, RequestId, MAX_REQUEST_ID};
use std::collections::HashMap;

/// Pending function calls keyed by their 24-bit request id.
#[derive(Default)]
pub struct RequestRegistry {
    last_id: RequestId,
    calls: HashMap<RequestId, Responder<DataResult>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next request id. The first id is 1; after
    /// `MAX_REQUEST_ID` the counter wraps to 0.
    ///
    /// A wrapped id is handed out again even if its previous holder is still
    /// waiting; the older responder is then dropped without firing.
    pub fn next_id(&mut self) -> RequestId {
        self.last_id = if self.last_id >= MAX_REQUEST_ID {
            0
        } else {
            self.last_id + 1
        };
        self.last_id
    }

    pub fn register(&mut self, id: RequestId, responder: Responder<DataResult>) {
        if self.calls.insert(id, responder).is_some() {
            tracing::warn!("request id {} reused while still pending", id);
        }
    }

    /// Resolves a call with its result. Unknown ids are ignored.
    pub fn resolve(&mut self, id: RequestId, payload: String) -> Option<Notification> {
        match self.calls.remove(&id) {
            Some(responder) => Some(responder.bind(Ok(payload))),
            None => {
                tracing::debug!("result for unknown request id {}", id);
                None
            }
        }
    }

    pub fn fail(&mut self, id: RequestId, error: &ErrorPayload) -> Option<Notification> {
        self.calls
            .remove(&id)
            .map(|responder| responder.bind(Err(error.clone())))
    }

    pub fn pending(&self) -> usize {
        self.calls.len()
    }

    #[cfg(test)]
    fn set_last_id(&mut self, id: RequestId) {
        self.last_id = id;
    }
}

/// Current auth state plus the negotiation in flight, if any.
#[derive(Default)]
pub struct AuthState {
    current: String,
    requested: Option<String>,
    responder: Option<Responder<String>>,
}

impl AuthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> &str {
        &self.current
    }

    pub fn in_flight(&self) -> bool {
        self.requested.is_some()
    }

    /// Starts a negotiation. Returns `false` if one is already in flight.
    pub fn begin(&mut self, state: String, responder: Responder<String>) -> bool {
        if self.in_flight() {
            return false;
        }
        self.requested = Some(state);
        self.responder = Some(responder);
        true
    }

    /// Applies the server's auth reply.
    ///
    /// `"true"` accepts the requested state; anything else replaces the
    /// current state. The responder fires once, later server pushes only
    /// update the state.
    pub fn resolve(&mut self, reply: String) -> Option<Notification> {
        let requested = self.requested.take();
        self.current = if reply == "true" {
            requested.unwrap_or_default()
        } else {
            reply
        };
        self.responder
            .take()
            .map(|responder| responder.bind(self.current.clone()))
    }
}
