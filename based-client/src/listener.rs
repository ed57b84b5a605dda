//! Callback abstractions used by the registries.
//!
//! [`Listener`] fires until it is unregistered; [`Responder`] fires exactly
//! once and is consumed. Registries never invoke either directly: they hand
//! back [`Notification`]s that the engine runs after releasing its lock.

use based_protocol::{Checksum, ErrorPayload};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Subscription id handed out by `observe`, `get` and `channel_subscribe`.
pub type SubId = u32;

/// A deferred listener invocation.
pub type Notification = Box<dyn FnOnce() + Send>;

/// Value delivered to observable subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservableData {
    pub payload: String,
    pub checksum: Checksum,
}

/// Result delivered to observable subscriptions.
pub type ObserveResult = Result<ObservableData, ErrorPayload>;

/// Result delivered to function calls, gets and channel subscriptions.
pub type DataResult = Result<String, ErrorPayload>;

/// Multi-shot callback.
pub struct Listener<T> {
    callback: Arc<dyn Fn(T) + Send + Sync>,
}

impl<T: Send + 'static> Listener<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
        }
    }

    /// Forwards every value into an unbounded channel.
    pub fn from_channel(tx: mpsc::UnboundedSender<T>) -> Self {
        Self::new(move |value| {
            let _ = tx.send(value);
        })
    }

    /// Binds a value to this listener without invoking it.
    pub fn bind(&self, value: T) -> Notification {
        let callback = Arc::clone(&self.callback);
        Box::new(move || callback(value))
    }
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            callback: Arc::clone(&self.callback),
        }
    }
}

impl<T> fmt::Debug for Listener<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Listener")
    }
}

/// Single-shot callback.
pub struct Responder<T> {
    callback: Box<dyn FnOnce(T) + Send>,
}

impl<T: Send + 'static> Responder<T> {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnOnce(T) + Send + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Completes a oneshot channel with the value.
    pub fn from_oneshot(tx: oneshot::Sender<T>) -> Self {
        Self::new(move |value| {
            let _ = tx.send(value);
        })
    }

    /// Consumes the responder, binding the value to it.
    pub fn bind(self, value: T) -> Notification {
        let callback = self.callback;
        Box::new(move || callback(value))
    }
}

impl<T> fmt::Debug for Responder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Responder")
    }
}

/// Runs notifications in order.
pub fn dispatch(notifications: Vec<Notification>) {
    for notify in notifications {
        notify();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_listener_fires_each_time() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let listener = Listener::new(move |n: usize| {
            seen.fetch_add(n, Ordering::SeqCst);
        });

        let pending = vec![listener.bind(1), listener.clone().bind(2)];
        assert_eq!(count.load(Ordering::SeqCst), 0);
        dispatch(pending);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_listener_channel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = Listener::from_channel(tx);
        dispatch(vec![listener.bind("a"), listener.bind("b")]);
        assert_eq!(rx.recv().await, Some("a"));
        assert_eq!(rx.recv().await, Some("b"));
    }

    #[tokio::test]
    async fn test_responder_oneshot() {
        let (tx, rx) = oneshot::channel();
        let responder: Responder<DataResult> = Responder::from_oneshot(tx);
        dispatch(vec![responder.bind(Ok("done".to_string()))]);
        assert_eq!(rx.await.unwrap(), Ok("done".to_string()));
    }

    #[test]
    fn test_dropped_receiver_is_ignored() {
        let (tx, rx) = oneshot::channel::<u8>();
        drop(rx);
        Responder::from_oneshot(tx).bind(1)();
    }
}
