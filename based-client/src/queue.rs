//! Typed outbound frame queues.

use based_protocol::ObsId;
use bytes::{Bytes, BytesMut};

/// Queue kinds in drain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    Auth,
    ChannelSubscribe,
    ChannelUnsubscribe,
    ChannelPublish,
    Observe,
    Unobserve,
    Function,
    Get,
}

impl QueueKind {
    pub const DRAIN_ORDER: [QueueKind; 8] = [
        QueueKind::Auth,
        QueueKind::ChannelSubscribe,
        QueueKind::ChannelUnsubscribe,
        QueueKind::ChannelPublish,
        QueueKind::Observe,
        QueueKind::Unobserve,
        QueueKind::Function,
        QueueKind::Get,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

struct Queued {
    target: Option<ObsId>,
    frame: BytesMut,
}

/// Encoded frames waiting for an open connection.
#[derive(Default)]
pub struct OutboundQueue {
    queues: [Vec<Queued>; 8],
}

impl OutboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: QueueKind, frame: BytesMut) {
        self.queues[kind.index()].push(Queued {
            target: None,
            frame,
        });
    }

    /// Queues a frame addressed to one observable or channel id.
    pub fn push_for(&mut self, kind: QueueKind, target: ObsId, frame: BytesMut) {
        self.queues[kind.index()].push(Queued {
            target: Some(target),
            frame,
        });
    }

    /// Drops queued frames of `kind` addressed to `target`. Returns how many
    /// were removed.
    pub fn remove_for(&mut self, kind: QueueKind, target: ObsId) -> usize {
        let queue = &mut self.queues[kind.index()];
        let before = queue.len();
        queue.retain(|queued| queued.target != Some(target));
        before - queue.len()
    }

    /// Replaces the auth queue: only the latest auth frame matters.
    pub fn set_auth(&mut self, frame: BytesMut) {
        let queue = &mut self.queues[QueueKind::Auth.index()];
        queue.clear();
        queue.push(Queued {
            target: None,
            frame,
        });
    }

    pub fn clear(&mut self, kind: QueueKind) {
        self.queues[kind.index()].clear();
    }

    pub fn len(&self, kind: QueueKind) -> usize {
        self.queues[kind.index()].len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(Vec::is_empty)
    }

    /// Concatenates all queued frames in drain order, without clearing.
    pub fn snapshot(&self) -> Option<Bytes> {
        if self.is_empty() {
            return None;
        }
        let size: usize = self.queues.iter().flatten().map(|q| q.frame.len()).sum();
        let mut buf = BytesMut::with_capacity(size);
        for kind in QueueKind::DRAIN_ORDER {
            for queued in &self.queues[kind.index()] {
                buf.extend_from_slice(&queued.frame);
            }
        }
        Some(buf.freeze())
    }

    /// Clears every queue after a successful hand-off.
    pub fn clear_all(&mut self) {
        for queue in &mut self.queues {
            queue.clear();
        }
    }
}
