// ── In-memory FleetStore ──
//
// DashMap-backed store: concurrent O(1) lookups, atomic per-key
// upserts. Backs the test suite and small single-process deployments.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::model::{Endpoint, EndpointStatus, InstanceKey, MirroredInstance};

use super::{FleetStore, StoreError};

/// In-memory implementation of [`FleetStore`].
#[derive(Default)]
pub struct MemoryStore {
    endpoints: DashMap<Uuid, Endpoint>,
    instances: DashMap<InstanceKey, MirroredInstance>,
    counts: DashMap<Uuid, u64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an endpoint. Used by embedders and tests; the engine
    /// itself never creates endpoints.
    pub fn insert_endpoint(&self, endpoint: Endpoint) {
        self.endpoints.insert(endpoint.id, endpoint);
    }

    pub fn remove_endpoint(&self, id: Uuid) {
        self.endpoints.remove(&id);
        self.instances.retain(|key, _| key.endpoint_id != id);
        self.counts.remove(&id);
    }

    /// Derived instance count as of the last recount.
    pub fn instance_count(&self, endpoint_id: Uuid) -> u64 {
        self.counts.get(&endpoint_id).map_or(0, |c| *c)
    }

    pub fn instances_for(&self, endpoint_id: Uuid) -> Vec<MirroredInstance> {
        self.instances
            .iter()
            .filter(|entry| entry.key().endpoint_id == endpoint_id)
            .map(|entry| entry.value().clone())
            .collect()
    }
}

impl FleetStore for MemoryStore {
    async fn endpoint(&self, id: Uuid) -> Option<Endpoint> {
        self.endpoints.get(&id).map(|e| e.value().clone())
    }

    async fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.iter().map(|e| e.value().clone()).collect()
    }

    async fn instance(&self, key: &InstanceKey) -> Option<MirroredInstance> {
        self.instances.get(key).map(|i| i.value().clone())
    }

    async fn upsert_instance(&self, instance: MirroredInstance) -> Result<(), StoreError> {
        self.instances.insert(instance.key.clone(), instance);
        Ok(())
    }

    async fn delete_instance(
        &self,
        key: &InstanceKey,
    ) -> Result<Option<MirroredInstance>, StoreError> {
        Ok(self.instances.remove(key).map(|(_, v)| v))
    }

    async fn instance_name_in_use(&self, endpoint_id: Uuid, name: &str) -> bool {
        self.instances
            .iter()
            .any(|entry| entry.key().endpoint_id == endpoint_id && entry.value().name == name)
    }

    async fn set_endpoint_status(
        &self,
        id: Uuid,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // A status write for an endpoint deleted mid-flight is a no-op.
        if let Some(mut endpoint) = self.endpoints.get_mut(&id) {
            endpoint.status = status;
            endpoint.last_checked = Some(checked_at);
        }
        Ok(())
    }

    async fn recount_instances(&self, endpoint_id: Uuid) -> Result<u64, StoreError> {
        let count = self
            .instances
            .iter()
            .filter(|entry| entry.key().endpoint_id == endpoint_id)
            .count() as u64;
        self.counts.insert(endpoint_id, count);
        Ok(count)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use portway_api::{InstanceMode, InstanceStatus, TrafficCounters};

    fn instance(endpoint_id: Uuid, remote_id: &str) -> MirroredInstance {
        MirroredInstance {
            key: InstanceKey::new(endpoint_id, remote_id),
            name: remote_id.into(),
            mode: InstanceMode::Server,
            status: InstanceStatus::Running,
            tunnel_host: String::new(),
            tunnel_port: 9000,
            target_host: String::new(),
            target_port: 0,
            tls: crate::model::TunnelTls::Off,
            crt_path: None,
            key_path: None,
            log_level: crate::model::LogLevel::Info,
            descriptor: String::new(),
            traffic: TrafficCounters::default(),
            last_event_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn upsert_get_delete_cycle() {
        let store = MemoryStore::new();
        let endpoint_id = Uuid::new_v4();
        let key = InstanceKey::new(endpoint_id, "abc");

        store.upsert_instance(instance(endpoint_id, "abc")).await.unwrap();
        assert!(store.instance(&key).await.is_some());

        let removed = store.delete_instance(&key).await.unwrap();
        assert!(removed.is_some());
        assert!(store.instance(&key).await.is_none());

        // Absence is not an error.
        assert!(store.delete_instance(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recount_tracks_per_endpoint() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.upsert_instance(instance(a, "one")).await.unwrap();
        store.upsert_instance(instance(a, "two")).await.unwrap();
        store.upsert_instance(instance(b, "one")).await.unwrap();

        assert_eq!(store.recount_instances(a).await.unwrap(), 2);
        assert_eq!(store.recount_instances(b).await.unwrap(), 1);
        assert_eq!(store.instance_count(a), 2);
    }

    #[tokio::test]
    async fn name_in_use_is_scoped_to_endpoint() {
        let store = MemoryStore::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        store.upsert_instance(instance(a, "web")).await.unwrap();
        assert!(store.instance_name_in_use(a, "web").await);
        assert!(!store.instance_name_in_use(b, "web").await);
    }
}
