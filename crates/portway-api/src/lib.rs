// portway-api: Async client for a tunnel-relay endpoint's control API.
//
// One endpoint = one remote relay node exposing `{base}{api_path}/...`:
// a liveness probe and a long-lived server-push event stream. This crate
// owns the transport, the wire codec, and the single-connection stream;
// retry and fleet orchestration live in portway-core.

pub mod client;
pub mod error;
pub mod transport;
pub mod wire;

pub use client::{EndpointClient, EndpointTarget, EventStream};
pub use error::Error;
pub use transport::{TlsMode, TransportConfig};
pub use wire::{Event, EventKind, FrameParser, InstanceMode, InstanceSnapshot, InstanceStatus, TrafficCounters};
