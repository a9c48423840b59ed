// ── Persistence interface ──
//
// The engine consumes storage through `FleetStore`; the real backend
// (relational store, migrations) lives outside this crate. `MemoryStore`
// ships for tests and lightweight embedding.

mod memory;

use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{Endpoint, EndpointStatus, InstanceKey, MirroredInstance};

pub use memory::MemoryStore;

/// A storage write was refused. The engine logs these per event and
/// keeps the connection up — the next event may self-heal the row.
#[derive(Debug, Clone, Error)]
#[error("storage error: {0}")]
pub struct StoreError(pub String);

/// Storage surface the engine depends on.
///
/// Reads cover the endpoint registry (to open connections); writes are
/// limited to endpoint reachability and the mirrored-instance rows.
/// `upsert_instance` must be atomic per key — concurrent upserts for
/// the same `(endpoint, remote id)` must never produce duplicate rows.
pub trait FleetStore: Send + Sync + 'static {
    fn endpoint(&self, id: Uuid) -> impl Future<Output = Option<Endpoint>> + Send;

    fn endpoints(&self) -> impl Future<Output = Vec<Endpoint>> + Send;

    fn instance(&self, key: &InstanceKey) -> impl Future<Output = Option<MirroredInstance>> + Send;

    fn upsert_instance(
        &self,
        instance: MirroredInstance,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Remove a row. Absence is not an error — returns what was there.
    fn delete_instance(
        &self,
        key: &InstanceKey,
    ) -> impl Future<Output = Result<Option<MirroredInstance>, StoreError>> + Send;

    /// Is a display name already taken within this endpoint?
    fn instance_name_in_use(
        &self,
        endpoint_id: Uuid,
        name: &str,
    ) -> impl Future<Output = bool> + Send;

    fn set_endpoint_status(
        &self,
        id: Uuid,
        status: EndpointStatus,
        checked_at: DateTime<Utc>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Recompute the endpoint's derived instance count after a
    /// create/delete. Eventually consistent by design.
    fn recount_instances(&self, endpoint_id: Uuid)
    -> impl Future<Output = Result<u64, StoreError>> + Send;
}
