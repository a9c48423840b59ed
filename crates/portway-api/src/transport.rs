// Shared transport configuration for building reqwest::Client instances.
//
// The probe client and the stream client share TLS and header settings
// but differ on timeouts: a total request timeout would kill a healthy
// long-lived event stream, so the stream client gets a connect timeout
// only.

use std::path::PathBuf;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::error::Error;

/// TLS verification mode for endpoint connections.
#[derive(Debug, Clone, Default)]
pub enum TlsMode {
    /// Use the system certificate store (strict).
    System,
    /// Use a custom CA certificate from the given PEM file.
    CustomCa(PathBuf),
    /// Accept any certificate. Default — relay nodes typically run
    /// self-signed on private networks.
    #[default]
    DangerAcceptInvalid,
}

/// Shared transport configuration for building HTTP clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub tls: TlsMode,
    /// Total request timeout for probe and control calls.
    pub timeout: Duration,
    /// Connect timeout, applied to both clients.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tls: TlsMode::default(),
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl TransportConfig {
    /// Build the request/response client (probe, control calls).
    pub fn build_client(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        self.builder(headers)?
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    /// Build the streaming client. No total timeout — the event stream
    /// stays open for the lifetime of the connection.
    pub fn build_stream_client(&self, headers: HeaderMap) -> Result<reqwest::Client, Error> {
        self.builder(headers)?
            .build()
            .map_err(|e| Error::Tls(format!("failed to build HTTP client: {e}")))
    }

    fn builder(&self, headers: HeaderMap) -> Result<reqwest::ClientBuilder, Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(concat!("portway/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers);

        match &self.tls {
            TlsMode::System => {}
            TlsMode::CustomCa(path) => {
                let cert_pem = std::fs::read(path)
                    .map_err(|e| Error::Tls(format!("failed to read CA cert: {e}")))?;
                let cert = reqwest::Certificate::from_pem(&cert_pem)
                    .map_err(|e| Error::Tls(format!("invalid CA cert: {e}")))?;
                builder = builder.add_root_certificate(cert);
            }
            TlsMode::DangerAcceptInvalid => {
                builder = builder.danger_accept_invalid_certs(true);
            }
        }

        Ok(builder)
    }
}

/// Build the default header map carrying the endpoint credential.
///
/// The key travels as `X-API-Key` on every request; the header value is
/// marked sensitive so it never shows up in debug logs.
pub(crate) fn api_key_headers(api_key: &str) -> Result<HeaderMap, Error> {
    let mut value = HeaderValue::from_str(api_key)
        .map_err(|_| Error::Decode { message: "API key contains invalid header characters".into() })?;
    value.set_sensitive(true);

    let mut headers = HeaderMap::new();
    headers.insert("X-API-Key", value);
    Ok(headers)
}
