// Integration tests for the supervisor: ingestion, retry ceiling,
// manual stop, graceful remote shutdown, and the health-probe loop.
//
// wiremock covers request/response cases; a small raw TCP fixture
// stands in for an endpoint that holds its event stream open, which
// wiremock cannot do.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pretty_assertions::assert_eq;
use secrecy::SecretString;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use uuid::Uuid;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use portway_api::TransportConfig;
use portway_core::{
    ConnState, CoreError, EndpointStatus, EngineConfig, FleetStore, InstanceKey, InstanceStatus,
    MemoryStore, Scope, Supervisor,
};

// ── Helpers ─────────────────────────────────────────────────────────

fn endpoint(id: Uuid, uri: &str) -> portway_core::Endpoint {
    portway_core::Endpoint {
        id,
        name: format!("relay-{id}"),
        url: uri.parse().expect("endpoint uri"),
        api_path: "/api".into(),
        api_key: SecretString::from("test-key".to_string()),
        status: EndpointStatus::Offline,
        last_checked: None,
    }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        max_retries: 3,
        backoff_base: Duration::from_millis(5),
        backoff_cap: Duration::from_millis(50),
        health_interval: Duration::from_millis(25),
        activity_timeout: Duration::from_millis(50),
        subscriber_buffer: 64,
    }
}

fn supervisor_with(store: Arc<MemoryStore>) -> Supervisor<MemoryStore> {
    Supervisor::new(store, fast_config(), TransportConfig::default())
}

/// Poll until `check` passes or the deadline expires.
async fn wait_for<F>(what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check().await {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ── Ingestion ───────────────────────────────────────────────────────

#[tokio::test]
async fn initial_then_update_lands_in_store() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: initial\n",
        "data: {\"time\":\"2026-03-01T10:00:00Z\",\"instance\":{\"id\":\"abc\",\"mode\":\"server\",\"status\":\"running\",\"url\":\"server://:9000/:3389?log=debug\",\"tcpRx\":100}}\n",
        "\n",
        "event: update\n",
        "data: {\"id\":\"abc\",\"status\":\"stopped\",\"tcpRx\":150,\"time\":\"2026-03-01T10:00:05Z\"}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &server.uri()));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.connect(id).await.expect("connect");

    let key = InstanceKey::new(id, "abc");
    wait_for("mirrored instance to reach its final state", async || {
        store
            .instance(&key)
            .await
            .is_some_and(|row| row.status == InstanceStatus::Stopped && row.traffic.tcp_rx == 150)
    })
    .await;

    let row = store.instance(&key).await.expect("row");
    assert_eq!(row.name, "abc");
    assert_eq!(row.tunnel_port, 9000);
    assert_eq!(row.target_port, 3389);
    assert_eq!(store.instance_count(id), 1);

    // Endpoint went online when the stream opened.
    let persisted = store.endpoint(id).await.expect("endpoint");
    assert_eq!(persisted.status, EndpointStatus::Online);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn instance_events_reach_scoped_subscribers() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: log\n",
        "data: {\"id\":\"abc\",\"log\":\"listener bound\",\"time\":\"2026-03-01T10:00:00Z\"}\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &server.uri()));

    let supervisor = supervisor_with(Arc::clone(&store));
    let mut on_abc = supervisor.hub().subscribe(Uuid::new_v4(), Scope::Instance("abc".into()));
    let mut on_global = supervisor.hub().subscribe(Uuid::new_v4(), Scope::Global);

    supervisor.connect(id).await.expect("connect");

    // The instance subscriber gets the re-framed log event, and the
    // frame is in the same block shape as the inbound protocol.
    let frame = tokio::time::timeout(Duration::from_secs(5), on_abc.next())
        .await
        .expect("frame within deadline")
        .expect("frame");
    let text = String::from_utf8(frame.to_vec()).expect("utf8");
    assert!(text.starts_with("event: log\n"), "unexpected frame: {text}");
    assert!(text.contains("listener bound"));
    assert!(text.ends_with("\n\n"));

    // Global subscribers see the reachability flip, not instance events.
    let frame = tokio::time::timeout(Duration::from_secs(5), on_global.next())
        .await
        .expect("status frame within deadline")
        .expect("frame");
    let text = String::from_utf8(frame.to_vec()).expect("utf8");
    assert!(text.starts_with("event: status\n"), "unexpected frame: {text}");
    assert!(text.contains("online"));

    supervisor.shutdown().await;
}

// ── Retry ceiling ───────────────────────────────────────────────────

#[tokio::test]
async fn retry_ceiling_drops_entry_and_marks_offline() {
    // Grab a port, then close the server: every connect is refused.
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &uri));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.connect(id).await.expect("connect spawns");

    wait_for("connection entry to be dropped", async || {
        supervisor.status(id).await.is_none()
    })
    .await;

    // Transport failures exhaust into `offline`, not `failed`.
    let persisted = store.endpoint(id).await.expect("endpoint");
    assert_eq!(persisted.status, EndpointStatus::Offline);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn credential_rejection_exhausts_into_failed() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &server.uri()));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.connect(id).await.expect("connect spawns");

    wait_for("connection entry to be dropped", async || {
        supervisor.status(id).await.is_none()
    })
    .await;

    let persisted = store.endpoint(id).await.expect("endpoint");
    assert_eq!(persisted.status, EndpointStatus::Failed);

    supervisor.shutdown().await;
}

#[tokio::test]
async fn connect_unknown_endpoint_errors() {
    let supervisor = supervisor_with(Arc::new(MemoryStore::new()));
    let err = supervisor.connect(Uuid::new_v4()).await.expect_err("unknown endpoint");
    assert!(matches!(err, CoreError::EndpointNotFound { .. }));
}

// ── Manual stop ─────────────────────────────────────────────────────

#[tokio::test]
async fn disconnect_is_absorbing_until_reset() {
    // No server at all — connects are refused, which would normally
    // drive the retry machine. A manual stop must freeze all of it.
    let server = MockServer::start().await;
    let uri = server.uri();
    drop(server);

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &uri));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.start().await.expect("start");
    supervisor.disconnect(id).await;

    let status = supervisor.status(id).await.expect("entry kept");
    assert_eq!(status.state, ConnState::ManuallyStopped);
    let persisted = store.endpoint(id).await.expect("endpoint");
    assert_eq!(persisted.status, EndpointStatus::Offline);

    // Let several health ticks and would-be retries pass: the manual
    // stop absorbs everything.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let status = supervisor.status(id).await.expect("entry kept");
    assert_eq!(status.state, ConnState::ManuallyStopped);

    // Reset clears the stop; with the server still gone, the clean
    // retry counter runs to the ceiling and the entry is dropped.
    supervisor.reset_and_reconnect(id).await.expect("reset");
    wait_for("reset connection to exhaust its retries", async || {
        supervisor.status(id).await.is_none()
    })
    .await;

    supervisor.shutdown().await;
}

// ── Graceful remote shutdown ────────────────────────────────────────

#[tokio::test]
async fn remote_shutdown_suppresses_reconnect() {
    let server = MockServer::start().await;
    let body = concat!(
        "event: initial\n",
        "data: {\"id\":\"abc\",\"status\":\"running\",\"time\":\"2026-03-01T10:00:00Z\"}\n",
        "\n",
        "event: shutdown\n",
        "\n",
    );
    Mock::given(method("GET"))
        .and(path("/api/events"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &server.uri()));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.connect(id).await.expect("connect");

    wait_for("graceful disconnect", async || {
        supervisor
            .status(id)
            .await
            .is_some_and(|s| s.state == ConnState::Disconnected && s.retry_count == 0)
    })
    .await;

    let persisted = store.endpoint(id).await.expect("endpoint");
    assert_eq!(persisted.status, EndpointStatus::Offline);

    // No retry timer was armed: the request count stays put.
    let before = server.received_requests().await.expect("requests").len();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after = server.received_requests().await.expect("requests").len();
    assert_eq!(before, after, "shutdown must not trigger a reconnect");

    supervisor.shutdown().await;
}

// ── Health probes (raw TCP fixture) ─────────────────────────────────

/// Minimal HTTP responder: serves `/api/events` as a held-open stream
/// and `/api/ping` as a one-shot response. Counts what it sees.
struct RelayFixture {
    uri: String,
    events_opened: Arc<AtomicUsize>,
    pings_seen: Arc<AtomicUsize>,
}

async fn spawn_relay_fixture(ping_status: &'static str) -> RelayFixture {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let events_opened = Arc::new(AtomicUsize::new(0));
    let pings_seen = Arc::new(AtomicUsize::new(0));

    let opened = Arc::clone(&events_opened);
    let pings = Arc::clone(&pings_seen);
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            let opened = Arc::clone(&opened);
            let pings = Arc::clone(&pings);
            tokio::spawn(async move {
                // Read until the end of the request headers.
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }
                let request = String::from_utf8_lossy(&request);

                if request.starts_with("GET /api/events") {
                    opened.fetch_add(1, Ordering::SeqCst);
                    let response = concat!(
                        "HTTP/1.1 200 OK\r\n",
                        "Content-Type: text/event-stream\r\n",
                        "\r\n",
                        "event: initial\n",
                        "data: {\"id\":\"abc\",\"status\":\"running\",\"time\":\"2026-03-01T10:00:00Z\"}\n",
                        "\n",
                    );
                    if socket.write_all(response.as_bytes()).await.is_err() {
                        return;
                    }
                    // Hold the stream open; the test tears us down.
                    tokio::time::sleep(Duration::from_secs(30)).await;
                } else if request.starts_with("GET /api/ping") {
                    pings.fetch_add(1, Ordering::SeqCst);
                    let response =
                        format!("HTTP/1.1 {ping_status}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
                    let _ = socket.write_all(response.as_bytes()).await;
                }
            });
        }
    });

    RelayFixture { uri: format!("http://{addr}"), events_opened, pings_seen }
}

#[tokio::test]
async fn idle_connection_is_probed_and_stays_connected() {
    let fixture = spawn_relay_fixture("204 No Content").await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &fixture.uri));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.start().await.expect("start");

    wait_for("connection to establish", async || {
        supervisor.status(id).await.is_some_and(|s| s.state == ConnState::Connected)
    })
    .await;

    // The stream goes quiet after the initial event; once the activity
    // window lapses, the health loop probes instead of reconnecting.
    wait_for("liveness probe", async || fixture.pings_seen.load(Ordering::SeqCst) >= 1).await;

    let status = supervisor.status(id).await.expect("status");
    assert_eq!(status.state, ConnState::Connected);
    assert_eq!(
        fixture.events_opened.load(Ordering::SeqCst),
        1,
        "a passing probe must not reopen the stream"
    );

    supervisor.shutdown().await;
}

#[tokio::test]
async fn failed_probe_tears_down_and_reconnects() {
    let fixture = spawn_relay_fixture("503 Service Unavailable").await;

    let store = Arc::new(MemoryStore::new());
    let id = Uuid::new_v4();
    store.insert_endpoint(endpoint(id, &fixture.uri));

    let supervisor = supervisor_with(Arc::clone(&store));
    supervisor.start().await.expect("start");

    wait_for("connection to establish", async || {
        supervisor.status(id).await.is_some_and(|s| s.state == ConnState::Connected)
    })
    .await;

    // Failing probe → unhealthy → retry path → fresh stream.
    wait_for("stream to be reopened after failed probe", async || {
        fixture.events_opened.load(Ordering::SeqCst) >= 2
    })
    .await;
    assert!(fixture.pings_seen.load(Ordering::SeqCst) >= 1);

    supervisor.shutdown().await;
}
