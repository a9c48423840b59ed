// ── Endpoint control-API client ──
//
// One `EndpointClient` per remote relay node. Two HTTP clients back it:
// a bounded-timeout one for the liveness probe and a stream one (connect
// timeout only) for the long-lived event stream.
//
// The stream itself follows "stream or die": `EventStream` yields parsed
// events until EOF or an I/O error, and never reconnects. Reconnection
// policy belongs to the supervisor in portway-core.

use std::collections::VecDeque;
use std::pin::Pin;

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::{TransportConfig, api_key_headers};
use crate::wire::{Event, FrameParser};

// ── EndpointTarget ──────────────────────────────────────────────────

/// Where and how to reach one endpoint's control API.
///
/// Built by the caller from its endpoint record; this crate never reads
/// configuration itself.
#[derive(Debug, Clone)]
pub struct EndpointTarget {
    /// Endpoint base URL (e.g. `https://relay-1.example.net:7443`).
    pub base_url: Url,
    /// Control-path prefix under the base URL (e.g. `/api`).
    pub api_path: String,
    /// Credential sent as `X-API-Key` on every request.
    pub api_key: SecretString,
}

impl EndpointTarget {
    /// Join base URL, control-path prefix, and a leaf path.
    fn control_url(&self, leaf: &str) -> Result<Url, Error> {
        let base = self.base_url.as_str().trim_end_matches('/');
        let prefix = self.api_path.trim_end_matches('/');
        let joined = if prefix.is_empty() || prefix.starts_with('/') {
            format!("{base}{prefix}{leaf}")
        } else {
            format!("{base}/{prefix}{leaf}")
        };
        Ok(Url::parse(&joined)?)
    }
}

// ── EndpointClient ──────────────────────────────────────────────────

/// Client for a single endpoint's control API.
pub struct EndpointClient {
    target: EndpointTarget,
    http: reqwest::Client,
    stream_http: reqwest::Client,
}

impl EndpointClient {
    pub fn new(target: EndpointTarget, transport: &TransportConfig) -> Result<Self, Error> {
        let headers = api_key_headers(target.api_key.expose_secret())?;
        let http = transport.build_client(headers.clone())?;
        let stream_http = transport.build_stream_client(headers)?;
        Ok(Self { target, http, stream_http })
    }

    /// Lightweight liveness probe: `GET {base}{api_path}/ping`.
    ///
    /// Any success status passes.
    pub async fn ping(&self) -> Result<(), Error> {
        let url = self.target.control_url("/ping")?;
        debug!(url = %url, "probing endpoint");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(Error::UnexpectedStatus { status: status.as_u16() })
        }
    }

    /// Open the event stream: `GET {base}{api_path}/events`.
    ///
    /// A non-success status is an immediate terminal error; otherwise
    /// the response body is fed through the wire parser for the life of
    /// the connection.
    pub async fn events(&self) -> Result<EventStream, Error> {
        let url = self.target.control_url("/events")?;
        debug!(url = %url, "opening event stream");
        let response = self
            .stream_http
            .get(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UnexpectedStatus { status: status.as_u16() });
        }

        Ok(EventStream {
            body: Box::pin(response.bytes_stream()),
            parser: FrameParser::new(),
            pending: VecDeque::new(),
        })
    }
}

// ── EventStream ─────────────────────────────────────────────────────

/// A live event stream from one endpoint. Yields events until the
/// remote closes the stream (`None`) or the transport fails (`Err`).
pub struct EventStream {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    parser: FrameParser,
    pending: VecDeque<Event>,
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventStream")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl EventStream {
    /// Next parsed event. `None` means EOF — the remote closed the
    /// stream without an explicit shutdown event.
    ///
    /// Cancel-safe: events parsed from a chunk are queued before any
    /// await, so dropping this future between polls loses nothing.
    pub async fn next_event(&mut self) -> Option<Result<Event, Error>> {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return Some(Ok(event));
            }
            match self.body.next().await {
                Some(Ok(chunk)) => self.pending.extend(self.parser.feed(&chunk)),
                Some(Err(e)) => return Some(Err(e.into())),
                None => return None,
            }
        }
    }
}
