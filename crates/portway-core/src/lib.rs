// portway-core: Engine between portway-api and the console's outer layers.
//
// Owns the per-endpoint connection lifecycle (supervisor), the durable
// mirrored-instance projection (reconciler + store trait), and live
// fan-out to local subscribers (hub). The CRUD/HTTP layer and the real
// persistence backend sit outside this crate and talk to it through
// `Supervisor`, `FleetStore`, and `Hub`.

pub mod config;
pub mod error;
pub mod hub;
pub mod model;
pub mod reconcile;
pub mod store;
pub mod supervisor;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::EngineConfig;
pub use error::CoreError;
pub use hub::{Hub, Scope, Subscription};
pub use reconcile::Reconciler;
pub use store::{FleetStore, MemoryStore, StoreError};
pub use supervisor::{ConnState, ConnectionStatus, Supervisor};

// Re-export model types at the crate root for ergonomics.
pub use model::{
    Descriptor, Endpoint, EndpointStatus, InstanceKey, LogLevel, MirroredInstance, TunnelTls,
};

// Wire-level types shared with the api crate.
pub use portway_api::{Event, EventKind, InstanceMode, InstanceSnapshot, InstanceStatus, TrafficCounters};
