// ── Engine tuning configuration ──
//
// These values describe *how* the supervisor drives connections. They
// never touch disk — the embedding application constructs an
// `EngineConfig` and hands it in.

use std::time::Duration;

/// Runtime tuning for the supervisor and hub.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Consecutive stream failures tolerated before the connection
    /// entry is dropped and the endpoint is marked offline.
    pub max_retries: u32,
    /// First-step backoff; doubles per consecutive failure.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_cap: Duration,
    /// How often the health-check loop ticks.
    pub health_interval: Duration,
    /// A connection with no observed activity for this long gets a
    /// liveness probe on the next health tick.
    pub activity_timeout: Duration,
    /// Bounded buffer size per hub subscriber. A subscriber that falls
    /// this far behind is dropped.
    pub subscriber_buffer: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_millis(1000),
            backoff_cap: Duration::from_millis(30_000),
            health_interval: Duration::from_secs(30),
            activity_timeout: Duration::from_secs(60),
            subscriber_buffer: 64,
        }
    }
}
