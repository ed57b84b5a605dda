//! Channel registry.
//!
//! Listener tracking and publish registrations live in separate tables.
//! Publish registrations are never dropped: the server may ask for a
//! republish at any time, even when nobody listens.

use crate::error::ClientError;
use crate::listener::{DataResult, Listener, Notification, SubId};
use crate::registry::Query;
use based_protocol::{ErrorPayload, ObsId};
use std::collections::{BTreeSet, HashMap};

struct Channel {
    query: Query,
    subs: BTreeSet<SubId>,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: HashMap<ObsId, Channel>,
    subscriptions: HashMap<SubId, (ObsId, Listener<DataResult>)>,
    publishers: HashMap<ObsId, Query>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, id: ObsId, query: &Query) -> Result<(), ClientError> {
        if let Some(channel) = self.channels.get(&id) {
            channel.query.check_collision(id, query)?;
        }
        if let Some(existing) = self.publishers.get(&id) {
            existing.check_collision(id, query)?;
        }
        Ok(())
    }

    /// Adds a listener. Returns `true` when the channel was not active and a
    /// subscribe frame must be sent. Call [`check`](Self::check) first.
    pub fn subscribe(
        &mut self,
        id: ObsId,
        query: Query,
        sub_id: SubId,
        listener: Listener<DataResult>,
    ) -> bool {
        self.subscriptions.insert(sub_id, (id, listener));
        match self.channels.get_mut(&id) {
            Some(channel) => {
                channel.subs.insert(sub_id);
                false
            }
            None => {
                self.channels.insert(
                    id,
                    Channel {
                        query,
                        subs: BTreeSet::from([sub_id]),
                    },
                );
                true
            }
        }
    }

    /// Removes a listener. Returns the channel id when it was the last one.
    pub fn unsubscribe(&mut self, sub_id: SubId) -> Option<ObsId> {
        let (id, _) = self.subscriptions.remove(&sub_id)?;
        let channel = self.channels.get_mut(&id)?;
        channel.subs.remove(&sub_id);
        if channel.subs.is_empty() {
            self.channels.remove(&id);
            return Some(id);
        }
        None
    }

    /// Remembers the query behind a publish. Call [`check`](Self::check) first.
    pub fn register_publisher(&mut self, id: ObsId, query: Query) {
        self.publishers.entry(id).or_insert(query);
    }

    /// Query to republish, if this client ever published to `id`.
    pub fn publisher(&self, id: ObsId) -> Option<&Query> {
        self.publishers.get(&id)
    }

    pub fn is_active(&self, id: ObsId) -> bool {
        self.channels.contains_key(&id)
    }

    /// Iterates channels with at least one listener.
    pub fn active(&self) -> impl Iterator<Item = (ObsId, &Query)> {
        self.channels.iter().map(|(id, ch)| (*id, &ch.query))
    }

    /// Delivers a channel message to every listener.
    pub fn deliver(&self, id: ObsId, payload: &str) -> Vec<Notification> {
        let Some(channel) = self.channels.get(&id) else {
            tracing::debug!("channel message for {:#x} without listeners", id);
            return Vec::new();
        };
        channel
            .subs
            .iter()
            .filter_map(|sub_id| self.subscriptions.get(sub_id))
            .map(|(_, listener)| listener.bind(Ok(payload.to_string())))
            .collect()
    }

    /// Drops every listener of a channel after delivering `error` once.
    /// The publish registration is kept.
    pub fn fail(&mut self, id: ObsId, error: &ErrorPayload) -> Vec<Notification> {
        let Some(channel) = self.channels.remove(&id) else {
            return Vec::new();
        };
        channel
            .subs
            .into_iter()
            .filter_map(|sub_id| self.subscriptions.remove(&sub_id))
            .map(|(_, listener)| listener.bind(Err(error.clone())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::dispatch;
    use parking_lot::Mutex;
    use std::sync::Arc;

    fn recording() -> (Listener<DataResult>, Arc<Mutex<Vec<DataResult>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        (Listener::new(move |r| sink.lock().push(r)), log)
    }

    #[test]
    fn test_subscribe_dedup_and_unsubscribe() {
        let mut registry = ChannelRegistry::new();
        let (l1, _) = recording();
        let (l2, _) = recording();

        assert!(registry.subscribe(3, Query::new("chat", ""), 0, l1));
        assert!(!registry.subscribe(3, Query::new("chat", ""), 1, l2));
        assert_eq!(registry.unsubscribe(0), None);
        assert_eq!(registry.unsubscribe(1), Some(3));
        assert!(!registry.is_active(3));
    }

    #[test]
    fn test_deliver() {
        let mut registry = ChannelRegistry::new();
        let (l1, log1) = recording();
        let (l2, log2) = recording();
        registry.subscribe(3, Query::new("chat", ""), 0, l1);
        registry.subscribe(3, Query::new("chat", ""), 1, l2);

        dispatch(registry.deliver(3, "\"hi\""));
        assert_eq!(*log1.lock(), vec![Ok("\"hi\"".to_string())]);
        assert_eq!(*log2.lock(), vec![Ok("\"hi\"".to_string())]);
        assert!(registry.deliver(4, "x").is_empty());
    }

    #[test]
    fn test_publisher_survives_unsubscribe_and_error() {
        let mut registry = ChannelRegistry::new();
        let (l1, log) = recording();
        registry.register_publisher(3, Query::new("chat", "{\"room\":1}"));
        registry.subscribe(3, Query::new("chat", "{\"room\":1}"), 0, l1);

        let error = ErrorPayload::for_channel(3, "closed");
        dispatch(registry.fail(3, &error));
        assert_eq!(*log.lock(), vec![Err(error)]);
        assert!(!registry.is_active(3));
        assert_eq!(registry.publisher(3).map(|q| q.name.as_str()), Some("chat"));
    }

    #[test]
    fn test_collision_with_publisher() {
        let mut registry = ChannelRegistry::new();
        registry.register_publisher(3, Query::new("a", ""));
        assert!(registry.check(3, &Query::new("a", "")).is_ok());
        assert!(registry.check(3, &Query::new("b", "")).is_err());
    }
}
