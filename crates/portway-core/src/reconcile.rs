// ── Reconciler ──
//
// Maps one stream event onto the mirrored-instance store. Re-applied
// events produce no writes, out-of-order events are ignored via the
// per-row ordering guard, and a keyed mutex makes
// create-if-absent-else-update atomic per (endpoint, instance) key, so
// concurrent `initial` bursts for the same id cannot produce duplicate
// rows.
//
// Nothing here ever errors upward: storage failures are logged per
// event and the connection stays up; the next event on the same
// instance may self-heal the row.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use portway_api::{Event, EventKind, InstanceSnapshot};

use crate::model::{InstanceKey, MirroredInstance};
use crate::store::FleetStore;

/// Applies events to the durable mirrored-instance projection.
pub struct Reconciler<S> {
    store: Arc<S>,
    /// Per-row write serialization. Entries live as long as the row.
    row_locks: DashMap<InstanceKey, Arc<Mutex<()>>>,
}

impl<S: FleetStore> Reconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, row_locks: DashMap::new() }
    }

    /// Apply one event. Missing or unknown instances are never an
    /// error; events that carry nothing actionable are ignored.
    pub async fn apply(&self, endpoint_id: Uuid, event: &Event) {
        match event.kind {
            EventKind::Initial | EventKind::Create | EventKind::Update => {
                self.apply_upsert(endpoint_id, event).await;
            }
            EventKind::Delete => self.apply_delete(endpoint_id, event).await,
            // Log lines and shutdown notices don't touch durable state.
            EventKind::Log | EventKind::Shutdown => {}
        }
    }

    async fn apply_upsert(&self, endpoint_id: Uuid, event: &Event) {
        let Some(snapshot) = &event.instance else {
            debug!(kind = %event.kind, "event without instance snapshot — nothing to mirror");
            return;
        };
        let key = InstanceKey::new(endpoint_id, &snapshot.id);

        let row_lock = self.row_lock(&key);
        let _guard = row_lock.lock().await;

        match self.store.instance(&key).await {
            None => self.insert_row(key, snapshot, event).await,
            Some(existing) => {
                // Ordering guard: tolerate out-of-order delivery by
                // ignoring anything older than the stored row.
                if event.occurred_at < existing.last_event_at {
                    debug!(
                        instance = %key,
                        event_at = %event.occurred_at,
                        stored_at = %existing.last_event_at,
                        "ignoring stale event"
                    );
                    return;
                }
                match existing.apply_snapshot(snapshot, event.occurred_at) {
                    // Pure no-op: skip the storage write entirely.
                    None => {}
                    Some(updated) => {
                        if let Err(e) = self.store.upsert_instance(updated).await {
                            warn!(instance = %key, error = %e, "instance update failed");
                        }
                    }
                }
            }
        }
    }

    async fn insert_row(&self, key: InstanceKey, snapshot: &InstanceSnapshot, event: &Event) {
        let name = self.unique_name(key.endpoint_id, &snapshot.id).await;
        let row = MirroredInstance::from_snapshot(key.clone(), name, snapshot, event.occurred_at);

        if let Err(e) = self.store.upsert_instance(row).await {
            warn!(instance = %key, error = %e, "instance insert failed");
            return;
        }
        debug!(instance = %key, kind = %event.kind, "mirrored new instance");

        if let Err(e) = self.store.recount_instances(key.endpoint_id).await {
            warn!(endpoint = %key.endpoint_id, error = %e, "instance recount failed");
        }
    }

    async fn apply_delete(&self, endpoint_id: Uuid, event: &Event) {
        let Some(remote_id) = event.instance_id() else {
            debug!("delete event without instance id");
            return;
        };
        let key = InstanceKey::new(endpoint_id, remote_id);

        let row_lock = self.row_lock(&key);
        {
            let _guard = row_lock.lock().await;
            match self.store.delete_instance(&key).await {
                Ok(Some(_)) => {
                    debug!(instance = %key, "mirrored instance removed");
                    if let Err(e) = self.store.recount_instances(endpoint_id).await {
                        warn!(endpoint = %endpoint_id, error = %e, "instance recount failed");
                    }
                }
                // Already gone — the instance may have been deleted by
                // an earlier event or was never mirrored.
                Ok(None) => {}
                Err(e) => warn!(instance = %key, error = %e, "instance delete failed"),
            }
        }
        self.row_locks.remove(&key);
    }

    fn row_lock(&self, key: &InstanceKey) -> Arc<Mutex<()>> {
        self.row_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Display name for a new row: the remote id if free, else the id
    /// with a numeric suffix, else a random fallback.
    async fn unique_name(&self, endpoint_id: Uuid, remote_id: &str) -> String {
        if !self.store.instance_name_in_use(endpoint_id, remote_id).await {
            return remote_id.to_string();
        }
        for n in 2..=99u32 {
            let candidate = format!("{remote_id}-{n}");
            if !self.store.instance_name_in_use(endpoint_id, &candidate).await {
                return candidate;
            }
        }
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{remote_id}-{}", &suffix[..8])
    }
}

// ── Tests ───────────────────────────────────────────────────────────
