// ── Fleet supervisor ──
//
// One connection task per endpoint, orchestrated by an explicit state
// machine:
//
//   Disconnected → Connecting → Connected → (Unhealthy | Disconnected)
//
// plus ManuallyStopped, an absorbing state only an explicit reconnect
// command leaves. The supervisor owns every retry decision — the
// connection itself (portway-api) streams or dies.
//
// Every transition is atomic under the registry mutex, and each
// connection attempt gets a generation number: reports from a
// superseded generation (a slow-dying stream, a probe that lost a
// race) are discarded so they cannot resurrect state after reconnect.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use portway_api::{
    EndpointClient, Error as ApiError, EventKind, TransportConfig, wire::encode_frame,
};

use crate::config::EngineConfig;
use crate::error::CoreError;
use crate::hub::{Hub, Scope};
use crate::model::{Endpoint, EndpointStatus};
use crate::reconcile::Reconciler;
use crate::store::FleetStore;

// ── Connection state ────────────────────────────────────────────────

/// Observable state of one endpoint connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    /// Liveness probe failed while the stream looked open.
    Unhealthy,
    /// Operator stop — auto-reconnect suppressed until an explicit
    /// connect/reset command.
    ManuallyStopped,
}

/// Snapshot answered by [`Supervisor::status`].
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub state: ConnState,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_activity: DateTime<Utc>,
}

/// In-memory book-keeping for one endpoint connection. Never persisted.
struct ConnectionEntry {
    state: ConnState,
    retry_count: u32,
    last_error: Option<String>,
    last_activity: DateTime<Utc>,
    /// Monotonic twin of `last_activity`, used for staleness checks.
    idle_since: Instant,
    /// Bumped on every (re)connect and on every forced teardown.
    /// Reports carrying an older generation are ignored.
    generation: u64,
    manually_stopped: bool,
    cancel: CancellationToken,
    retry_timer: Option<JoinHandle<()>>,
}

impl ConnectionEntry {
    fn new(root: &CancellationToken) -> Self {
        Self {
            state: ConnState::Disconnected,
            retry_count: 0,
            last_error: None,
            last_activity: Utc::now(),
            idle_since: Instant::now(),
            generation: 0,
            manually_stopped: false,
            cancel: root.child_token(),
            retry_timer: None,
        }
    }

    fn status(&self) -> ConnectionStatus {
        ConnectionStatus {
            state: self.state,
            retry_count: self.retry_count,
            last_error: self.last_error.clone(),
            last_activity: self.last_activity,
        }
    }

    fn touch(&mut self) {
        self.last_activity = Utc::now();
        self.idle_since = Instant::now();
    }

    /// Cancel the live stream and clear any pending retry timer.
    fn teardown(&mut self) {
        self.cancel.cancel();
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }
}

// ── Supervisor ──────────────────────────────────────────────────────

/// Orchestrates the fleet of endpoint connections.
///
/// Cheaply cloneable via `Arc`; background tasks hold clones.
pub struct Supervisor<S: FleetStore> {
    inner: Arc<Inner<S>>,
}

impl<S: FleetStore> Clone for Supervisor<S> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

struct Inner<S: FleetStore> {
    store: Arc<S>,
    hub: Arc<Hub>,
    reconciler: Reconciler<S>,
    config: EngineConfig,
    transport: TransportConfig,
    /// Single registry mutex: every state transition happens under it.
    connections: Mutex<HashMap<Uuid, ConnectionEntry>>,
    cancel: CancellationToken,
    health_task: Mutex<Option<JoinHandle<()>>>,
}

impl<S: FleetStore> Supervisor<S> {
    pub fn new(store: Arc<S>, config: EngineConfig, transport: TransportConfig) -> Self {
        let hub = Arc::new(Hub::new(config.subscriber_buffer));
        let reconciler = Reconciler::new(Arc::clone(&store));
        Self {
            inner: Arc::new(Inner {
                store,
                hub,
                reconciler,
                config,
                transport,
                connections: Mutex::new(HashMap::new()),
                cancel: CancellationToken::new(),
                health_task: Mutex::new(None),
            }),
        }
    }

    /// The fan-out hub local subscribers attach to.
    pub fn hub(&self) -> &Arc<Hub> {
        &self.inner.hub
    }

    // ── Control surface ─────────────────────────────────────────

    /// Open a connection for every registered endpoint and start the
    /// health-check loop. Idempotent.
    pub async fn start(&self) -> Result<(), CoreError> {
        {
            let mut slot = self.inner.health_task.lock().await;
            if slot.is_none() {
                let supervisor = self.clone();
                let cancel = self.inner.cancel.clone();
                *slot = Some(tokio::spawn(async move {
                    supervisor.health_loop(cancel).await;
                }));
            }
        }

        let endpoints = self.inner.store.endpoints().await;
        info!(count = endpoints.len(), "starting endpoint connections");
        for endpoint in endpoints {
            self.connect_endpoint(endpoint).await;
        }
        Ok(())
    }

    /// Cancel every connection and pending retry timer, stop the
    /// health loop, and clear the registry.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        if let Some(task) = self.inner.health_task.lock().await.take() {
            task.abort();
        }
        let mut connections = self.inner.connections.lock().await;
        for (_, mut entry) in connections.drain() {
            entry.teardown();
        }
        info!("supervisor shut down");
    }

    /// Open (or reopen) the connection for one endpoint. Clears a
    /// manual stop — this *is* the explicit reconnect command.
    pub async fn connect(&self, endpoint_id: Uuid) -> Result<(), CoreError> {
        let endpoint = self
            .inner
            .store
            .endpoint(endpoint_id)
            .await
            .ok_or(CoreError::EndpointNotFound { id: endpoint_id })?;
        self.connect_endpoint(endpoint).await;
        Ok(())
    }

    /// Manually stop one connection: cancel the stream, clear any
    /// pending retry, persist `offline`, and suppress auto-reconnect
    /// until [`connect`](Self::connect) or
    /// [`reset_and_reconnect`](Self::reset_and_reconnect).
    pub async fn disconnect(&self, endpoint_id: Uuid) {
        let stopped = {
            let mut connections = self.inner.connections.lock().await;
            match connections.get_mut(&endpoint_id) {
                Some(entry) => {
                    entry.teardown();
                    entry.cancel = self.inner.cancel.child_token();
                    entry.generation += 1;
                    entry.manually_stopped = true;
                    entry.state = ConnState::ManuallyStopped;
                    true
                }
                None => false,
            }
        };
        if stopped {
            info!(endpoint = %endpoint_id, "connection manually stopped");
            self.persist_status(endpoint_id, EndpointStatus::Offline).await;
        }
    }

    /// Clear the manual stop and any accumulated retry state, then
    /// reconnect from a clean slate.
    pub async fn reset_and_reconnect(&self, endpoint_id: Uuid) -> Result<(), CoreError> {
        {
            let mut connections = self.inner.connections.lock().await;
            if let Some(entry) = connections.get_mut(&endpoint_id) {
                entry.manually_stopped = false;
                entry.retry_count = 0;
                entry.last_error = None;
            }
        }
        self.connect(endpoint_id).await
    }

    /// Drop the connection entry unconditionally — manual stop or not.
    /// Called when the endpoint itself is deleted.
    pub async fn remove(&self, endpoint_id: Uuid) {
        let mut connections = self.inner.connections.lock().await;
        if let Some(mut entry) = connections.remove(&endpoint_id) {
            entry.teardown();
            info!(endpoint = %endpoint_id, "connection entry removed");
        }
    }

    /// Current state of one connection, if tracked.
    pub async fn status(&self, endpoint_id: Uuid) -> Option<ConnectionStatus> {
        let connections = self.inner.connections.lock().await;
        connections.get(&endpoint_id).map(ConnectionEntry::status)
    }

    /// Current state of every tracked connection.
    pub async fn statuses(&self) -> HashMap<Uuid, ConnectionStatus> {
        let connections = self.inner.connections.lock().await;
        connections.iter().map(|(id, entry)| (*id, entry.status())).collect()
    }

    // ── Connection lifecycle ────────────────────────────────────

    async fn connect_endpoint(&self, endpoint: Endpoint) {
        let mut connections = self.inner.connections.lock().await;
        let entry = connections
            .entry(endpoint.id)
            .or_insert_with(|| ConnectionEntry::new(&self.inner.cancel));
        entry.manually_stopped = false;
        self.spawn_locked(entry, endpoint);
    }

    /// Replace whatever the entry was doing with a fresh connection
    /// attempt. Caller holds the registry lock.
    fn spawn_locked(&self, entry: &mut ConnectionEntry, endpoint: Endpoint) {
        entry.teardown();
        entry.cancel = self.inner.cancel.child_token();
        entry.generation += 1;
        entry.state = ConnState::Connecting;

        let generation = entry.generation;
        let token = entry.cancel.clone();
        let supervisor = self.clone();
        debug!(endpoint = %endpoint.id, generation, "spawning connection");
        tokio::spawn(async move {
            run_connection(supervisor, endpoint, generation, token).await;
        });
    }

    /// Record stream activity. Returns `false` if the caller's
    /// generation has been superseded — its events must be discarded.
    async fn touch(&self, endpoint_id: Uuid, generation: u64) -> bool {
        let mut connections = self.inner.connections.lock().await;
        match connections.get_mut(&endpoint_id) {
            Some(entry) if entry.generation == generation && !entry.manually_stopped => {
                entry.touch();
                true
            }
            _ => false,
        }
    }

    /// Stream open succeeded. Returns `false` if superseded.
    async fn on_connected(&self, endpoint_id: Uuid, generation: u64) -> bool {
        {
            let mut connections = self.inner.connections.lock().await;
            let Some(entry) = connections.get_mut(&endpoint_id) else { return false };
            if entry.generation != generation || entry.manually_stopped {
                return false;
            }
            entry.state = ConnState::Connected;
            entry.retry_count = 0;
            entry.last_error = None;
            entry.touch();
        }
        info!(endpoint = %endpoint_id, "endpoint connected");
        self.persist_status(endpoint_id, EndpointStatus::Online).await;
        true
    }

    /// The remote announced a graceful shutdown: terminal, not an
    /// error, and no retry this cycle.
    async fn on_remote_shutdown(&self, endpoint_id: Uuid, generation: u64) {
        {
            let mut connections = self.inner.connections.lock().await;
            let Some(entry) = connections.get_mut(&endpoint_id) else { return };
            if entry.generation != generation || entry.manually_stopped {
                return;
            }
            entry.state = ConnState::Disconnected;
            entry.retry_count = 0;
        }
        info!(endpoint = %endpoint_id, "remote shutdown — reconnect suppressed");
        self.persist_status(endpoint_id, EndpointStatus::Offline).await;
    }

    /// Central failure path: stream errors, EOFs, and failed probes all
    /// land here. Schedules a backoff retry below the ceiling; at the
    /// ceiling, drops the entry and persists the terminal status.
    async fn fail_connection(
        &self,
        endpoint_id: Uuid,
        generation: u64,
        error: &ApiError,
        from_probe: bool,
    ) {
        let dropped_as = {
            let mut connections = self.inner.connections.lock().await;
            let Some(entry) = connections.get_mut(&endpoint_id) else { return };
            if entry.generation != generation || entry.manually_stopped {
                debug!(endpoint = %endpoint_id, generation, "ignoring stale failure report");
                return;
            }

            if from_probe {
                // The stream task is still alive: cut it loose and
                // invalidate its eventual end-of-stream report.
                entry.cancel.cancel();
                entry.cancel = self.inner.cancel.child_token();
                entry.generation += 1;
                entry.state = ConnState::Unhealthy;
            } else {
                entry.state = ConnState::Disconnected;
            }

            entry.retry_count += 1;
            entry.last_error = Some(error.to_string());

            if entry.retry_count >= self.inner.config.max_retries {
                if let Some(mut entry) = connections.remove(&endpoint_id) {
                    entry.teardown();
                }
                Some(if error.is_transient() {
                    EndpointStatus::Offline
                } else {
                    EndpointStatus::Failed
                })
            } else {
                let delay = backoff_delay(entry.retry_count, &self.inner.config);
                warn!(
                    endpoint = %endpoint_id,
                    error = %error,
                    retry = entry.retry_count,
                    delay_ms = delay.as_millis() as u64,
                    "stream failed — retry scheduled"
                );

                let supervisor = self.clone();
                let expected_generation = entry.generation;
                let root = self.inner.cancel.clone();
                entry.retry_timer = Some(tokio::spawn(async move {
                    tokio::select! {
                        biased;
                        () = root.cancelled() => {}
                        () = tokio::time::sleep(delay) => {
                            supervisor.retry_now(endpoint_id, expected_generation).await;
                        }
                    }
                }));
                None
            }
        };

        if let Some(status) = dropped_as {
            warn!(endpoint = %endpoint_id, error = %error, "retry ceiling reached — giving up");
            self.persist_status(endpoint_id, status).await;
        }
    }

    /// Retry timer fired: reconnect if nothing changed in the meantime.
    async fn retry_now(&self, endpoint_id: Uuid, expected_generation: u64) {
        let Some(endpoint) = self.inner.store.endpoint(endpoint_id).await else {
            // Endpoint deleted while the retry was pending.
            self.remove(endpoint_id).await;
            return;
        };

        let mut connections = self.inner.connections.lock().await;
        let Some(entry) = connections.get_mut(&endpoint_id) else { return };
        if entry.generation != expected_generation || entry.manually_stopped {
            return;
        }
        self.spawn_locked(entry, endpoint);
    }

    // ── Health checking ─────────────────────────────────────────

    /// Fixed-interval loop: probe every connected endpoint with no
    /// observed activity inside the timeout window. Probes run in
    /// their own tasks so one slow endpoint never delays the rest.
    async fn health_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.health_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let stale: Vec<(Uuid, u64)> = {
                let connections = self.inner.connections.lock().await;
                connections
                    .iter()
                    .filter(|(_, entry)| {
                        entry.state == ConnState::Connected
                            && !entry.manually_stopped
                            && entry.idle_since.elapsed() >= self.inner.config.activity_timeout
                    })
                    .map(|(id, entry)| (*id, entry.generation))
                    .collect()
            };

            for (endpoint_id, generation) in stale {
                let supervisor = self.clone();
                tokio::spawn(async move {
                    supervisor.probe_endpoint(endpoint_id, generation).await;
                });
            }
        }
    }

    /// Liveness probe against an idle-looking connection. Success
    /// refreshes the activity clock without touching the stream;
    /// failure enters the same retry path as a stream failure.
    async fn probe_endpoint(&self, endpoint_id: Uuid, generation: u64) {
        let Some(endpoint) = self.inner.store.endpoint(endpoint_id).await else { return };

        let client = match EndpointClient::new(endpoint.target(), &self.inner.transport) {
            Ok(client) => client,
            Err(e) => {
                self.fail_connection(endpoint_id, generation, &e, true).await;
                return;
            }
        };

        match client.ping().await {
            Ok(()) => {
                if self.touch(endpoint_id, generation).await {
                    debug!(endpoint = %endpoint_id, "probe ok — activity refreshed");
                }
            }
            Err(e) => {
                warn!(endpoint = %endpoint_id, error = %e, "liveness probe failed");
                self.fail_connection(endpoint_id, generation, &e, true).await;
            }
        }
    }

    // ── Persistence & fan-out ───────────────────────────────────

    /// Write the endpoint's reachability and announce the flip to
    /// global subscribers.
    async fn persist_status(&self, endpoint_id: Uuid, status: EndpointStatus) {
        let checked_at = Utc::now();
        if let Err(e) = self.inner.store.set_endpoint_status(endpoint_id, status, checked_at).await
        {
            warn!(endpoint = %endpoint_id, error = %e, "endpoint status write failed");
        }

        let frame = encode_frame(
            "status",
            &json!({
                "endpointId": endpoint_id,
                "status": status.to_string(),
                "checkedAt": checked_at.to_rfc3339(),
            }),
        );
        self.inner.hub.publish(&Scope::Global, &frame);
    }
}

// ── Per-connection task ─────────────────────────────────────────────

/// Lifetime of one connection generation: open the stream, pump events
/// into the reconciler and the hub, report the terminal condition.
async fn run_connection<S: FleetStore>(
    supervisor: Supervisor<S>,
    endpoint: Endpoint,
    generation: u64,
    token: CancellationToken,
) {
    let endpoint_id = endpoint.id;

    let client = match EndpointClient::new(endpoint.target(), &supervisor.inner.transport) {
        Ok(client) => client,
        Err(e) => {
            supervisor.fail_connection(endpoint_id, generation, &e, false).await;
            return;
        }
    };

    let opened = tokio::select! {
        biased;
        () = token.cancelled() => return,
        opened = client.events() => opened,
    };
    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            supervisor.fail_connection(endpoint_id, generation, &e, false).await;
            return;
        }
    };

    if !supervisor.on_connected(endpoint_id, generation).await {
        return;
    }

    loop {
        let item = tokio::select! {
            biased;
            () = token.cancelled() => return,
            item = stream.next_event() => item,
        };

        match item {
            Some(Ok(event)) => {
                // Stale-generation guard: a superseded connection must
                // not resurrect state after a reconnect.
                if !supervisor.touch(endpoint_id, generation).await {
                    debug!(endpoint = %endpoint_id, generation, "superseded — dropping event");
                    return;
                }
                if event.kind == EventKind::Shutdown {
                    supervisor.on_remote_shutdown(endpoint_id, generation).await;
                    return;
                }

                supervisor.inner.reconciler.apply(endpoint_id, &event).await;

                match event.instance_id() {
                    Some(instance_id) => {
                        let scope = Scope::Instance(instance_id.to_string());
                        supervisor.inner.hub.publish(&scope, &event.to_frame());
                    }
                    None => debug!(kind = %event.kind, "event without instance id — not fanned out"),
                }
            }
            Some(Err(e)) => {
                supervisor.fail_connection(endpoint_id, generation, &e, false).await;
                return;
            }
            None => {
                // EOF without a shutdown event: treat as a failure so
                // the retry machine decides what happens next.
                supervisor
                    .fail_connection(endpoint_id, generation, &ApiError::StreamClosed, false)
                    .await;
                return;
            }
        }
    }
}

// ── Backoff ─────────────────────────────────────────────────────────

/// `min(base * 2^retry_count, cap)` — exponential, capped.
fn backoff_delay(retry_count: u32, config: &EngineConfig) -> Duration {
    let factor = 2u32.saturating_pow(retry_count.min(16));
    config.backoff_base.saturating_mul(factor).min(config.backoff_cap)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let config = EngineConfig::default();

        assert_eq!(backoff_delay(1, &config), Duration::from_millis(2000));
        assert_eq!(backoff_delay(2, &config), Duration::from_millis(4000));
        assert_eq!(backoff_delay(3, &config), Duration::from_millis(8000));
        // 2^6 = 64s, capped at 30s.
        assert_eq!(backoff_delay(6, &config), Duration::from_millis(30_000));
        // Huge counts must not overflow.
        assert_eq!(backoff_delay(u32::MAX, &config), Duration::from_millis(30_000));
    }

    #[test]
    fn conn_state_display_is_snake_case() {
        assert_eq!(ConnState::ManuallyStopped.to_string(), "manually_stopped");
        assert_eq!(ConnState::Connected.to_string(), "connected");
    }
}
