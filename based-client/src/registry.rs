//! Subscription registry: active observables, their subscriptions, pending
//! gets and the value cache.
//!
//! The registry owns every entity; callers only ever hold `obs_id`s and
//! `sub_id`s.

use crate::error::ClientError;
use crate::listener::{
    DataResult, Listener, Notification, ObservableData, ObserveResult, Responder, SubId,
};
use based_protocol::{apply_patch, canonical_payload, Checksum, ErrorPayload, ObsId};
use std::collections::{BTreeSet, HashMap};

/// Name and payload of an observable or channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Query {
    pub name: String,
    pub payload: String,
    canonical: String,
}

impl Query {
    pub fn new(name: impl Into<String>, payload: impl Into<String>) -> Self {
        let payload = payload.into();
        Self {
            name: name.into(),
            canonical: canonical_payload(&payload),
            payload,
        }
    }

    /// Whether two queries denote the same observable.
    pub fn same_as(&self, other: &Query) -> bool {
        self.name == other.name && self.canonical == other.canonical
    }

    /// Fails with [`ClientError::IdCollision`] if `self` is registered under
    /// `id` but differs from `incoming`.
    pub fn check_collision(&self, id: ObsId, incoming: &Query) -> Result<(), ClientError> {
        if self.same_as(incoming) {
            return Ok(());
        }
        Err(ClientError::IdCollision {
            id,
            existing: format!("{}({})", self.name, self.canonical),
        })
    }
}

/// Last value received for an observable, tagged with the query it
/// answered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub payload: String,
    pub checksum: Checksum,
    query: Query,
}

impl CacheEntry {
    pub fn query(&self) -> &Query {
        &self.query
    }
}

struct Observable {
    query: Query,
    subs: BTreeSet<SubId>,
}

struct PendingGets {
    query: Query,
    listeners: Vec<(SubId, Responder<DataResult>)>,
}

/// Outcome of registering a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObserveOutcome {
    /// First subscriber: an observe frame with this checksum must be sent.
    Created { checksum: Checksum },
    /// The observable is already active; nothing to send.
    Joined,
}

/// Outcome of registering a get.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetOutcome {
    /// No active observable: a get frame with this checksum must be sent.
    Request { checksum: Checksum },
    /// The next update of the active observable will answer it.
    AwaitUpdate,
}

/// Outcome of an incoming diff.
pub enum DiffOutcome {
    Applied(Vec<Notification>),
    /// The diff was discarded; the full value must be fetched again.
    Refetch(Refetch),
}

/// How to fetch a full value after a discarded diff.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Refetch {
    Observe(Query),
    Get(Query),
    /// Nobody is interested in the value anymore.
    Nothing,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    observables: HashMap<ObsId, Observable>,
    subscriptions: HashMap<SubId, (ObsId, Listener<ObserveResult>)>,
    gets: HashMap<ObsId, PendingGets>,
    cache: HashMap<ObsId, CacheEntry>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checks that `query` may be registered under `obs_id`.
    pub fn check(&self, obs_id: ObsId, query: &Query) -> Result<(), ClientError> {
        if let Some(observable) = self.observables.get(&obs_id) {
            observable.query.check_collision(obs_id, query)?;
        }
        if let Some(pending) = self.gets.get(&obs_id) {
            pending.query.check_collision(obs_id, query)?;
        }
        Ok(())
    }

    /// Best-known checksum for an observable, 0 if nothing is cached.
    pub fn cached_checksum(&self, obs_id: ObsId) -> Checksum {
        self.cache.get(&obs_id).map(|c| c.checksum).unwrap_or(0)
    }

    pub fn cached(&self, obs_id: ObsId) -> Option<&CacheEntry> {
        self.cache.get(&obs_id)
    }

    pub fn is_active(&self, obs_id: ObsId) -> bool {
        self.observables.contains_key(&obs_id)
    }

    pub fn active_count(&self) -> usize {
        self.observables.len()
    }

    /// Iterates active observables.
    pub fn active(&self) -> impl Iterator<Item = (ObsId, &Query)> {
        self.observables.iter().map(|(id, obs)| (*id, &obs.query))
    }

    /// Registers a subscription. Call [`check`](Self::check) first.
    pub fn observe(
        &mut self,
        obs_id: ObsId,
        query: Query,
        sub_id: SubId,
        listener: Listener<ObserveResult>,
    ) -> ObserveOutcome {
        self.subscriptions.insert(sub_id, (obs_id, listener));

        if let Some(observable) = self.observables.get_mut(&obs_id) {
            observable.subs.insert(sub_id);
            return ObserveOutcome::Joined;
        }

        let checksum = self.claim_cache(obs_id, &query);
        self.observables.insert(
            obs_id,
            Observable {
                query,
                subs: BTreeSet::from([sub_id]),
            },
        );
        ObserveOutcome::Created { checksum }
    }

    /// Registers a one-shot get. Call [`check`](Self::check) first.
    pub fn get(
        &mut self,
        obs_id: ObsId,
        query: Query,
        sub_id: SubId,
        responder: Responder<DataResult>,
    ) -> GetOutcome {
        let checksum = self.claim_cache(obs_id, &query);
        self.gets
            .entry(obs_id)
            .or_insert_with(|| PendingGets {
                query,
                listeners: Vec::new(),
            })
            .listeners
            .push((sub_id, responder));

        if self.is_active(obs_id) {
            GetOutcome::AwaitUpdate
        } else {
            GetOutcome::Request { checksum }
        }
    }

    /// Withdraws a get that was registered but could not be sent.
    pub fn cancel_get(&mut self, obs_id: ObsId, sub_id: SubId) {
        if let Some(pending) = self.gets.get_mut(&obs_id) {
            pending.listeners.retain(|(id, _)| *id != sub_id);
            if pending.listeners.is_empty() {
                self.gets.remove(&obs_id);
            }
        }
    }

    /// Removes a subscription. Returns the observable id when it was the
    /// last subscriber and the observable has been dropped.
    ///
    /// The cache entry survives so a later subscription can send its
    /// checksum.
    pub fn unobserve(&mut self, sub_id: SubId) -> Option<ObsId> {
        let (obs_id, _) = self.subscriptions.remove(&sub_id)?;
        let observable = self.observables.get_mut(&obs_id)?;
        observable.subs.remove(&sub_id);
        if observable.subs.is_empty() {
            self.observables.remove(&obs_id);
            return Some(obs_id);
        }
        None
    }

    /// Stores a full value and notifies subscriptions and pending gets.
    ///
    /// A value for an id with no known query is delivered to nobody and not
    /// cached.
    pub fn apply_data(
        &mut self,
        obs_id: ObsId,
        checksum: Checksum,
        payload: String,
    ) -> Vec<Notification> {
        match self.owner(obs_id).cloned() {
            Some(query) => {
                self.cache.insert(
                    obs_id,
                    CacheEntry {
                        payload: payload.clone(),
                        checksum,
                        query,
                    },
                );
            }
            None => tracing::debug!("not caching value for unknown {:#x}", obs_id),
        }
        self.fan_out(obs_id, payload, checksum)
    }

    /// Applies a diff to the cached value.
    ///
    /// The diff is discarded when nothing is cached, when `prev_checksum`
    /// does not match or when the patch does not fit the cached value. An
    /// empty patch keeps the value and adopts the new checksum.
    pub fn apply_diff(
        &mut self,
        obs_id: ObsId,
        checksum: Checksum,
        prev_checksum: Checksum,
        patch: &str,
    ) -> DiffOutcome {
        let cached_checksum = self.cached_checksum(obs_id);
        if cached_checksum == 0 || cached_checksum != prev_checksum {
            tracing::debug!(
                "diff for {:#x} expects checksum {} but cache has {}",
                obs_id,
                prev_checksum,
                cached_checksum
            );
            return DiffOutcome::Refetch(self.refetch(obs_id));
        }

        let Some(current) = self.cache.get(&obs_id) else {
            return DiffOutcome::Refetch(self.refetch(obs_id));
        };

        let patched = if patch.is_empty() {
            Ok(current.payload.clone())
        } else {
            patch_value(&current.payload, patch)
        };

        match patched {
            Ok(payload) => DiffOutcome::Applied(self.apply_data(obs_id, checksum, payload)),
            Err(reason) => {
                tracing::warn!("discarding diff for {:#x}: {}", obs_id, reason);
                DiffOutcome::Refetch(self.refetch(obs_id))
            }
        }
    }

    /// Answers pending gets from the cache after a get-unchanged reply.
    pub fn get_unchanged(&mut self, obs_id: ObsId) -> Vec<Notification> {
        let Some(cached) = self.cache.get(&obs_id) else {
            tracing::warn!("get-unchanged for {:#x} without a cached value", obs_id);
            return Vec::new();
        };
        let payload = cached.payload.clone();
        self.take_gets(obs_id)
            .into_iter()
            .map(|responder| responder.bind(Ok(payload.clone())))
            .collect()
    }

    /// Tears an observable down, delivering `error` to every subscription
    /// and pending get once.
    pub fn fail_observable(&mut self, obs_id: ObsId, error: &ErrorPayload) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if let Some(observable) = self.observables.remove(&obs_id) {
            for sub_id in observable.subs {
                if let Some((_, listener)) = self.subscriptions.remove(&sub_id) {
                    notifications.push(listener.bind(Err(error.clone())));
                }
            }
        }

        notifications.extend(self.fail_gets(obs_id, error));
        notifications
    }

    /// Resolves the pending gets stored under `key` with `error`.
    pub fn fail_gets(&mut self, key: ObsId, error: &ErrorPayload) -> Vec<Notification> {
        self.take_gets(key)
            .into_iter()
            .map(|responder| responder.bind(Err(error.clone())))
            .collect()
    }

    pub fn has_pending_gets(&self, obs_id: ObsId) -> bool {
        self.gets.contains_key(&obs_id)
    }

    /// Query currently registered under `obs_id`, falling back to the one
    /// the cached value belongs to.
    fn owner(&self, obs_id: ObsId) -> Option<&Query> {
        self.observables
            .get(&obs_id)
            .map(|o| &o.query)
            .or_else(|| self.gets.get(&obs_id).map(|p| &p.query))
            .or_else(|| self.cache.get(&obs_id).map(|c| &c.query))
    }

    /// Checksum to send when `query` is requested under `obs_id`. A cached
    /// value that belongs to a different query is evicted.
    fn claim_cache(&mut self, obs_id: ObsId, query: &Query) -> Checksum {
        match self.cache.get(&obs_id) {
            Some(entry) if entry.query.same_as(query) => entry.checksum,
            Some(entry) => {
                tracing::warn!(
                    "evicting cached {}({}) for colliding id {:#x}",
                    entry.query.name,
                    entry.query.canonical,
                    obs_id
                );
                self.cache.remove(&obs_id);
                0
            }
            None => 0,
        }
    }

    fn refetch(&self, obs_id: ObsId) -> Refetch {
        if let Some(observable) = self.observables.get(&obs_id) {
            Refetch::Observe(observable.query.clone())
        } else if let Some(pending) = self.gets.get(&obs_id) {
            Refetch::Get(pending.query.clone())
        } else {
            Refetch::Nothing
        }
    }

    fn fan_out(&mut self, obs_id: ObsId, payload: String, checksum: Checksum) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if let Some(observable) = self.observables.get(&obs_id) {
            for sub_id in &observable.subs {
                if let Some((_, listener)) = self.subscriptions.get(sub_id) {
                    notifications.push(listener.bind(Ok(ObservableData {
                        payload: payload.clone(),
                        checksum,
                    })));
                }
            }
        }

        for responder in self.take_gets(obs_id) {
            notifications.push(responder.bind(Ok(payload.clone())));
        }

        notifications
    }

    fn take_gets(&mut self, obs_id: ObsId) -> Vec<Responder<DataResult>> {
        self.gets
            .remove(&obs_id)
            .map(|pending| pending.listeners.into_iter().map(|(_, r)| r).collect())
            .unwrap_or_default()
    }
}

fn patch_value(cached: &str, patch: &str) -> Result<String, String> {
    let value: serde_json::Value =
        serde_json::from_str(cached).map_err(|e| format!("cached value: {}", e))?;
    let patch: serde_json::Value =
        serde_json::from_str(patch).map_err(|e| format!("patch: {}", e))?;
    let patched = apply_patch(value, &patch).map_err(|e| e.to_string())?;
    serde_json::to_string(&patched).map_err(|e| e.to_string())
}
