// ── Event wire codec ──
//
// The endpoint push protocol is a stream of blank-line-delimited blocks:
//
//     event: update
//     data: {"time":"2026-01-01T00:00:00Z","instance":{...}}
//
// `FrameParser` turns raw byte chunks into typed [`Event`]s, buffering
// partial blocks across chunk boundaries. A malformed block is dropped
// with a warning — one bad block must never kill the connection.
// `encode_frame` writes the same block shape, so local subscribers can
// reuse this parser on the outbound side.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

// ── Event kinds ─────────────────────────────────────────────────────

/// Kind tag of a single stream event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    /// State replay sent right after the stream opens, one per instance.
    Initial,
    Create,
    Update,
    Delete,
    /// Free-text log line for one instance.
    Log,
    /// Graceful remote shutdown. Terminal, suppresses auto-reconnect.
    Shutdown,
}

/// Forwarding direction of a remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceMode {
    Server,
    Client,
}

/// Lifecycle status of a remote instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InstanceStatus {
    Running,
    Stopped,
    Error,
}

// ── Payload types ───────────────────────────────────────────────────

/// Cumulative traffic counters for the four channels of an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficCounters {
    #[serde(alias = "tcp_rx")]
    pub tcp_rx: u64,
    #[serde(alias = "tcp_tx")]
    pub tcp_tx: u64,
    #[serde(alias = "udp_rx")]
    pub udp_rx: u64,
    #[serde(alias = "udp_tx")]
    pub udp_tx: u64,
}

/// Point-in-time snapshot of one remote instance, as carried by a
/// stream event. Fields the endpoint omitted stay `None` so the
/// reconciler can tell "unchanged" from "reported".
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSnapshot {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<InstanceMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<InstanceStatus>,
    /// Descriptor URL encoding address/port/target/options.
    #[serde(rename = "url", skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<String>,
    #[serde(flatten)]
    pub traffic: Option<TrafficCounters>,
}

/// One parsed unit from an endpoint's event stream.
///
/// Constructed exactly once by the parser; downstream code matches on
/// `kind` and never re-probes raw JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub kind: EventKind,
    pub occurred_at: DateTime<Utc>,
    pub instance: Option<InstanceSnapshot>,
    pub log: Option<String>,
}

impl Event {
    /// Remote instance id this event refers to, if any.
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|i| i.id.as_str())
    }

    /// Encode this event as an outbound frame in the same block shape
    /// as the inbound protocol.
    pub fn to_frame(&self) -> Bytes {
        let mut data = serde_json::Map::new();
        data.insert(
            "time".into(),
            json!(self.occurred_at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        if let Some(instance) = &self.instance {
            match serde_json::to_value(instance) {
                Ok(v) => {
                    data.insert("instance".into(), v);
                }
                Err(e) => warn!(error = %e, "instance snapshot not serializable"),
            }
        }
        if let Some(log) = &self.log {
            data.insert("log".into(), json!(log));
        }
        encode_frame(&self.kind.to_string(), &serde_json::Value::Object(data))
    }
}

/// Write one `event:` + `data:` block, blank-line terminated.
pub fn encode_frame(event: &str, data: &serde_json::Value) -> Bytes {
    let body = data.to_string();
    let mut out = String::with_capacity(event.len() + body.len() + 16);
    out.push_str("event: ");
    out.push_str(event);
    out.push_str("\ndata: ");
    out.push_str(&body);
    out.push_str("\n\n");
    Bytes::from(out)
}

// ── Raw payload shapes ──────────────────────────────────────────────

/// Timestamp as the endpoint sends it: RFC 3339 string or epoch millis.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawTime {
    Iso(DateTime<Utc>),
    Millis(i64),
}

impl RawTime {
    fn resolve(self) -> Option<DateTime<Utc>> {
        match self {
            Self::Iso(t) => Some(t),
            Self::Millis(ms) => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Instance fields, every one optional. Used both for the historical
/// nested shape and (via flatten) the flat shape.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawInstance {
    #[serde(alias = "instanceId")]
    id: Option<String>,
    #[serde(alias = "type")]
    mode: Option<InstanceMode>,
    status: Option<InstanceStatus>,
    #[serde(alias = "descriptor")]
    url: Option<String>,
    #[serde(alias = "tcp_rx")]
    tcp_rx: Option<u64>,
    #[serde(alias = "tcp_tx")]
    tcp_tx: Option<u64>,
    #[serde(alias = "udp_rx")]
    udp_rx: Option<u64>,
    #[serde(alias = "udp_tx")]
    udp_tx: Option<u64>,
}

impl RawInstance {
    fn has_id(&self) -> bool {
        self.id.is_some()
    }

    fn into_snapshot(self) -> Option<InstanceSnapshot> {
        let id = self.id?;
        let traffic = if self.tcp_rx.is_some()
            || self.tcp_tx.is_some()
            || self.udp_rx.is_some()
            || self.udp_tx.is_some()
        {
            Some(TrafficCounters {
                tcp_rx: self.tcp_rx.unwrap_or(0),
                tcp_tx: self.tcp_tx.unwrap_or(0),
                udp_rx: self.udp_rx.unwrap_or(0),
                udp_tx: self.udp_tx.unwrap_or(0),
            })
        } else {
            None
        };
        Some(InstanceSnapshot {
            id,
            mode: self.mode,
            status: self.status,
            descriptor: self.url,
            traffic,
        })
    }
}

/// The `data:` JSON object. The endpoint sends either the historical
/// envelope (`{"time": ..., "instance": {...}}`) or the flatter shape
/// with instance fields at the top level; both normalize here.
#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPayload {
    #[serde(alias = "timestamp", alias = "occurredAt")]
    time: Option<RawTime>,
    instance: Option<RawInstance>,
    #[serde(alias = "message")]
    log: Option<String>,
    #[serde(flatten)]
    flat: RawInstance,
}

// ── FrameParser ─────────────────────────────────────────────────────

/// Incremental parser for the inbound event protocol.
///
/// Feed it byte chunks as they arrive; complete blocks come back as
/// [`Event`]s and a partial block at the chunk tail stays buffered
/// until completed by a later chunk.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered waiting for a block terminator.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Append a chunk and drain every block it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some((block_len, sep_len)) = find_block_boundary(&self.buf) {
            let block: Vec<u8> = self.buf.drain(..block_len + sep_len).take(block_len).collect();
            let text = String::from_utf8_lossy(&block);
            if text.trim().is_empty() {
                continue;
            }
            if let Some(event) = parse_block(&text) {
                events.push(event);
            }
        }
        events
    }
}

/// Find the first blank-line block terminator. Returns the block length
/// and the separator length (covers `\n\n` and `\n\r\n`).
fn find_block_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let mut i = 0;
    while i < buf.len() {
        if buf[i] == b'\n' {
            match (buf.get(i + 1), buf.get(i + 2)) {
                (Some(b'\n'), _) => return Some((i, 2)),
                (Some(b'\r'), Some(b'\n')) => return Some((i, 3)),
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Parse one complete block into an [`Event`].
///
/// Returns `None` (after logging) for anything malformed: missing or
/// unknown `event:` line, missing `data:` where one is required, or
/// undecodable JSON.
fn parse_block(text: &str) -> Option<Event> {
    let mut kind_str: Option<&str> = None;
    let mut data = String::new();
    let mut has_data = false;

    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(v) = line.strip_prefix("event:") {
            kind_str = Some(v.trim());
        } else if let Some(v) = line.strip_prefix("data:") {
            if has_data {
                data.push('\n');
            }
            data.push_str(v.trim());
            has_data = true;
        }
        // Other field lines (id:, retry:) carry nothing we use.
    }

    let Some(kind_str) = kind_str else {
        warn!(block = %text.trim(), "dropping block without event line");
        return None;
    };
    let Ok(kind) = kind_str.parse::<EventKind>() else {
        warn!(kind = kind_str, "dropping block with unknown event kind");
        return None;
    };

    if !has_data {
        // Shutdown legitimately carries no payload.
        if kind == EventKind::Shutdown {
            return Some(Event {
                kind,
                occurred_at: Utc::now(),
                instance: None,
                log: None,
            });
        }
        warn!(%kind, "dropping block without data line");
        return None;
    }

    let payload: RawPayload = match serde_json::from_str(&data) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, %kind, "dropping block with undecodable data");
            return None;
        }
    };

    let occurred_at = payload
        .time
        .and_then(RawTime::resolve)
        .unwrap_or_else(Utc::now);

    let instance = match payload.instance {
        Some(nested) => nested.into_snapshot(),
        None if payload.flat.has_id() => payload.flat.into_snapshot(),
        None => None,
    };

    if instance.is_none() && payload.log.is_none() && kind != EventKind::Shutdown {
        debug!(%kind, "block carries neither instance nor log");
    }

    Some(Event {
        kind,
        occurred_at,
        instance,
        log: payload.log,
    })
}

// ── Tests ───────────────────────────────────────────────────────────
