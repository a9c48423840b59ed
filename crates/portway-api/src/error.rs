use thiserror::Error;

/// Top-level error type for the `portway-api` crate.
///
/// Covers every failure mode of talking to a single endpoint: transport,
/// TLS, stream lifecycle, and payload decoding. `portway-core` maps these
/// into its own consumer-facing diagnostics and decides retry policy from
/// [`is_transient`](Self::is_transient).
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// HTTP transport error (connection refused, DNS failure, timeout, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL construction error (bad base URL or control-path prefix).
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// TLS configuration or handshake error.
    #[error("TLS error: {0}")]
    Tls(String),

    // ── Stream lifecycle ────────────────────────────────────────────
    /// The endpoint answered the stream or probe request with a
    /// non-success status. Terminal for the current connection.
    #[error("Endpoint rejected request with HTTP {status}")]
    UnexpectedStatus { status: u16 },

    /// The event stream ended (EOF) without an explicit shutdown event.
    #[error("Event stream closed by remote")]
    StreamClosed,

    // ── Data ────────────────────────────────────────────────────────
    /// A payload could not be decoded.
    #[error("Decode error: {message}")]
    Decode { message: String },
}

impl Error {
    /// Returns `true` if this is a transient failure worth retrying
    /// with backoff (vs. a hard failure such as a credential rejection).
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::StreamClosed => true,
            // Gateway hiccups recover; 4xx (bad key, unknown path) do not.
            Self::UnexpectedStatus { status } => matches!(status, 502..=504),
            Self::InvalidUrl(_) | Self::Tls(_) | Self::Decode { .. } => false,
        }
    }

    /// Returns `true` if the endpoint actively refused the credential.
    pub fn is_auth_rejected(&self) -> bool {
        matches!(self, Self::UnexpectedStatus { status: 401 | 403 })
    }
}
