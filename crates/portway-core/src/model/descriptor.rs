// ── Instance descriptor parsing ──
//
// A descriptor encodes one forwarding rule as a URL-ish string:
//
//     scheme://tunnelHost:tunnelPort/targetHost:targetPort?log=level&tls=mode&crt=path&key=path
//
// Everything beyond scheme and tunnel port is optional. Parsing is
// lenient: a malformed descriptor must never reject the instance it
// describes.
//
// Leniency rules:
//   - a bare `:port` host segment means "listen on all interfaces"
//   - a missing target segment defaults to host ""/port 0
//   - port values above 65535 clamp to 0 rather than erroring
//   - unknown tls modes and log levels fall back to the defaults

use serde::{Deserialize, Serialize};

/// TLS mode of a tunnel listener.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum TunnelTls {
    #[default]
    Off,
    Tls,
    Mutual,
}

impl TunnelTls {
    /// Lenient parse from a descriptor query value.
    fn from_query(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "tls" | "on" | "1" | "true" => Self::Tls,
            "mtls" | "mutual" => Self::Mutual,
            _ => Self::Off,
        }
    }
}

/// Log verbosity carried on an instance.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn from_query(value: &str) -> Self {
        value.parse().unwrap_or_default()
    }
}

/// Parsed form of a descriptor string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub scheme: String,
    /// Empty = listen on all interfaces.
    pub tunnel_host: String,
    pub tunnel_port: u16,
    pub target_host: String,
    pub target_port: u16,
    pub log_level: LogLevel,
    pub tls: TunnelTls,
    pub crt_path: Option<String>,
    pub key_path: Option<String>,
}

impl Descriptor {
    /// Parse a descriptor string. Never fails — absent or unparseable
    /// components take their documented defaults.
    pub fn parse(raw: &str) -> Self {
        let (scheme, rest) = match raw.split_once("://") {
            Some((s, r)) => (s, r),
            None => ("", raw),
        };

        let (address, query) = match rest.split_once('?') {
            Some((a, q)) => (a, q),
            None => (rest, ""),
        };

        let (tunnel, target) = match address.split_once('/') {
            Some((t, rest)) => (t, rest),
            None => (address, ""),
        };

        let (tunnel_host, tunnel_port) = split_host_port(tunnel);
        let (target_host, target_port) = split_host_port(target);

        let mut descriptor = Self {
            scheme: scheme.to_string(),
            tunnel_host,
            tunnel_port,
            target_host,
            target_port,
            ..Self::default()
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "log" => descriptor.log_level = LogLevel::from_query(value),
                "tls" => descriptor.tls = TunnelTls::from_query(value),
                "crt" if !value.is_empty() => descriptor.crt_path = Some(value.to_string()),
                "key" if !value.is_empty() => descriptor.key_path = Some(value.to_string()),
                _ => {}
            }
        }

        descriptor
    }
}

/// Split `host:port`, tolerating a bare `:port`, a bare host, or an
/// empty segment. Out-of-range and non-numeric ports clamp to 0.
fn split_host_port(segment: &str) -> (String, u16) {
    match segment.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), clamp_port(port)),
        None => (segment.to_string(), 0),
    }
}

fn clamp_port(raw: &str) -> u16 {
    match raw.parse::<u32>() {
        Ok(p) if p <= u32::from(u16::MAX) => p as u16,
        _ => 0,
    }
}
