// ── Mirrored instance domain types ──
//
// The local durable projection of one remote forwarding instance, plus
// the snapshot-merge rules the reconciler applies to it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use portway_api::{InstanceMode, InstanceSnapshot, InstanceStatus, TrafficCounters};

use super::descriptor::{Descriptor, LogLevel, TunnelTls};

// ── InstanceKey ─────────────────────────────────────────────────────

/// Primary key of a mirrored instance: one row per
/// (endpoint, remote instance id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub endpoint_id: Uuid,
    pub remote_id: String,
}

impl InstanceKey {
    pub fn new(endpoint_id: Uuid, remote_id: impl Into<String>) -> Self {
        Self { endpoint_id, remote_id: remote_id.into() }
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.endpoint_id, self.remote_id)
    }
}

// ── MirroredInstance ────────────────────────────────────────────────

/// Local projection of a remote instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirroredInstance {
    pub key: InstanceKey,
    /// Display name, auto-assigned from the remote id and uniqued
    /// within the endpoint.
    pub name: String,
    pub mode: InstanceMode,
    pub status: InstanceStatus,

    // Parsed from the descriptor.
    pub tunnel_host: String,
    pub tunnel_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub tls: TunnelTls,
    pub crt_path: Option<String>,
    pub key_path: Option<String>,
    pub log_level: LogLevel,
    /// The descriptor string as the endpoint sent it.
    pub descriptor: String,

    pub traffic: TrafficCounters,
    /// Timestamp of the last event applied to this row. Guards against
    /// out-of-order delivery: older events are ignored.
    pub last_event_at: DateTime<Utc>,
}

impl MirroredInstance {
    /// Build a fresh row from the first sighting of an instance.
    pub fn from_snapshot(
        key: InstanceKey,
        name: String,
        snapshot: &InstanceSnapshot,
        occurred_at: DateTime<Utc>,
    ) -> Self {
        let raw_descriptor = snapshot.descriptor.clone().unwrap_or_default();
        let parsed = Descriptor::parse(&raw_descriptor);

        // Mode preference: explicit snapshot field, else the descriptor
        // scheme, else server.
        let mode = snapshot
            .mode
            .or_else(|| parsed.scheme.parse().ok())
            .unwrap_or(InstanceMode::Server);

        Self {
            key,
            name,
            mode,
            status: snapshot.status.unwrap_or(InstanceStatus::Stopped),
            tunnel_host: parsed.tunnel_host,
            tunnel_port: parsed.tunnel_port,
            target_host: parsed.target_host,
            target_port: parsed.target_port,
            tls: parsed.tls,
            crt_path: parsed.crt_path,
            key_path: parsed.key_path,
            log_level: parsed.log_level,
            descriptor: raw_descriptor,
            traffic: snapshot.traffic.unwrap_or_default(),
            last_event_at: occurred_at,
        }
    }

    /// Merge a later snapshot into this row.
    ///
    /// Returns the updated row only if something actually changed; a
    /// pure no-op yields `None` so the caller skips the storage write.
    /// The ordering guard (`occurred_at` vs [`last_event_at`](Self::last_event_at))
    /// belongs to the caller.
    pub fn apply_snapshot(
        &self,
        snapshot: &InstanceSnapshot,
        occurred_at: DateTime<Utc>,
    ) -> Option<Self> {
        let mut updated = self.clone();
        let mut changed = false;

        if let Some(status) = snapshot.status {
            if status != updated.status {
                updated.status = status;
                changed = true;
            }
        }
        if let Some(mode) = snapshot.mode {
            if mode != updated.mode {
                updated.mode = mode;
                changed = true;
            }
        }
        if let Some(traffic) = snapshot.traffic {
            if traffic != updated.traffic {
                updated.traffic = traffic;
                changed = true;
            }
        }
        if let Some(descriptor) = &snapshot.descriptor {
            if *descriptor != updated.descriptor {
                let parsed = Descriptor::parse(descriptor);
                updated.tunnel_host = parsed.tunnel_host;
                updated.tunnel_port = parsed.tunnel_port;
                updated.target_host = parsed.target_host;
                updated.target_port = parsed.target_port;
                updated.tls = parsed.tls;
                updated.crt_path = parsed.crt_path;
                updated.key_path = parsed.key_path;
                updated.log_level = parsed.log_level;
                updated.descriptor = descriptor.clone();
                changed = true;
            }
        }

        if changed {
            updated.last_event_at = occurred_at;
            Some(updated)
        } else {
            None
        }
    }
}
