// ── Fan-out hub ──
//
// Registry of local subscribers keyed by scope. Every accepted event is
// re-published here as a raw frame; each subscriber gets its own bounded
// buffer, and a subscriber whose buffer is gone or full is removed
// without interrupting delivery to the rest.

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

// ── Scope ───────────────────────────────────────────────────────────

/// What a subscriber is watching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Cross-endpoint status changes (reachability flips).
    Global,
    /// Everything about one remote instance: state changes, metrics,
    /// log lines.
    Instance(String),
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => write!(f, "global"),
            Self::Instance(id) => write!(f, "instance:{id}"),
        }
    }
}

// ── Hub ─────────────────────────────────────────────────────────────

struct Subscriber {
    scope: Scope,
    tx: mpsc::Sender<Bytes>,
}

/// Live subscription handle. Dropping it detaches the subscriber; the
/// hub notices on the next matching publish.
pub struct Subscription {
    pub id: Uuid,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    /// Next delivered frame, or `None` once the subscription is removed
    /// from the hub.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// Subscriber registry and publisher.
pub struct Hub {
    subscribers: DashMap<Uuid, Subscriber>,
    buffer: usize,
}

impl Hub {
    /// `buffer` is the bounded per-subscriber queue depth.
    pub fn new(buffer: usize) -> Self {
        Self { subscribers: DashMap::new(), buffer: buffer.max(1) }
    }

    /// Attach a subscriber. An existing subscriber with the same id is
    /// replaced.
    pub fn subscribe(&self, id: Uuid, scope: Scope) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        debug!(subscriber = %id, scope = %scope, "subscriber attached");
        self.subscribers.insert(id, Subscriber { scope, tx });
        Subscription { id, rx }
    }

    /// Detach a subscriber explicitly.
    pub fn unsubscribe(&self, id: Uuid) {
        if self.subscribers.remove(&id).is_some() {
            debug!(subscriber = %id, "subscriber detached");
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Deliver `frame` verbatim to every subscriber whose scope matches.
    ///
    /// A failed write (receiver dropped, or buffer full — the consumer
    /// stopped draining) removes that subscriber only; delivery to the
    /// remaining subscribers continues. Returns how many got the frame.
    pub fn publish(&self, scope: &Scope, frame: &Bytes) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();

        for entry in self.subscribers.iter() {
            if entry.value().scope != *scope {
                continue;
            }
            match entry.value().tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => failed.push(*entry.key()),
            }
        }

        for id in failed {
            if self.subscribers.remove(&id).is_some() {
                warn!(subscriber = %id, "removing subscriber after failed delivery");
            }
        }

        delivered
    }
}

// ── Tests ───────────────────────────────────────────────────────────
