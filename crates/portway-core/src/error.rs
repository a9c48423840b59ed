// ── Core error types ──
//
// Consumer-facing errors from portway-core. Stream-level failures never
// surface here — the supervisor logs and retries those internally. What
// remains is what the control surface and storage can hand back.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Error type surfaced by the core crate's control surface.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The endpoint id is not known to the persistence layer.
    #[error("Endpoint not found: {id}")]
    EndpointNotFound { id: Uuid },

    /// The persistence layer refused a write.
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Endpoint API failure surfaced through a control-surface call.
    #[error("Endpoint API error: {message}")]
    Api { message: String, transient: bool },

    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl From<portway_api::Error> for CoreError {
    fn from(err: portway_api::Error) -> Self {
        match err {
            portway_api::Error::InvalidUrl(e) => Self::Config {
                message: format!("invalid endpoint URL: {e}"),
            },
            portway_api::Error::Tls(msg) => Self::Config {
                message: format!("TLS setup failed: {msg}"),
            },
            other => Self::Api {
                transient: other.is_transient(),
                message: other.to_string(),
            },
        }
    }
}
