// ── Endpoint domain types ──
//
// An endpoint row is owned by the persistence layer. The engine reads
// it to open connections and writes back only `status`/`last_checked`.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use portway_api::EndpointTarget;

/// Declared reachability of a remote relay node.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EndpointStatus {
    Online,
    Offline,
    /// Gave up after a non-transient failure (credential rejected,
    /// broken TLS setup) rather than plain unreachability.
    Failed,
}

/// A registered remote tunnel-relay node.
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub id: Uuid,
    pub name: String,
    /// Base URL, e.g. `https://relay-1.example.net:7443`.
    pub url: Url,
    /// Control-path prefix under the base URL, e.g. `/api`.
    pub api_path: String,
    pub api_key: SecretString,
    pub status: EndpointStatus,
    pub last_checked: Option<DateTime<Utc>>,
}

impl Endpoint {
    /// Connection target for the api crate.
    pub fn target(&self) -> EndpointTarget {
        EndpointTarget {
            base_url: self.url.clone(),
            api_path: self.api_path.clone(),
            api_key: self.api_key.clone(),
        }
    }
}
