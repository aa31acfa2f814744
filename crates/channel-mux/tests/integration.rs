use std::io::Write as _;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use channel_mux::{
    ConnectionManager, ConnectionState, Disposer, FetchFn, FetchFuture, HttpTokenProvider,
    LegacyFeatureSocket, LegacySocketConfig, ManagerConfig, ReconnectPolicy, config, static_token,
};
use futures_util::{SinkExt, StreamExt};
use httpmock::prelude::*;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite;
use url::Url;

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(300);

type WsStream = tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>;

struct MockHub {
    listener: TcpListener,
    port: u16,
}

impl MockHub {
    async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    fn url(&self) -> Url {
        Url::parse(&format!("ws://127.0.0.1:{}/ws", self.port)).unwrap()
    }

    /// Accept one TCP connection and return the raw WebSocket (no handshake).
    async fn accept_raw(&self) -> Result<WsStream, Box<dyn std::error::Error>> {
        let (tcp, _) = self.listener.accept().await?;
        let ws = tokio_tungstenite::accept_async(tcp).await?;
        Ok(ws)
    }

    /// Accept one connection, check the auth frame carries `token`, and ack it.
    async fn accept_and_authenticate(
        &self,
        token: &str,
    ) -> Result<WsStream, Box<dyn std::error::Error>> {
        let mut ws = self.accept_raw().await?;
        let auth = read_frame(&mut ws).await?;
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["token"], token);
        send_json(&mut ws, serde_json::json!({"type": "auth_ack", "status": "ok"})).await?;
        Ok(ws)
    }

    /// True if no client connects within a short quiet period.
    async fn stays_quiet(&self) -> bool {
        tokio::time::timeout(QUIET, self.listener.accept())
            .await
            .is_err()
    }
}

async fn read_frame(ws: &mut WsStream) -> Result<serde_json::Value, Box<dyn std::error::Error>> {
    loop {
        let frame = ws.next().await.ok_or("WebSocket closed unexpectedly")??;
        if let tungstenite::Message::Text(text) = frame {
            return Ok(serde_json::from_str(text.as_str())?);
        }
    }
}

async fn send_json(
    ws: &mut WsStream,
    value: serde_json::Value,
) -> Result<(), Box<dyn std::error::Error>> {
    ws.send(tungstenite::Message::Text(value.to_string().into()))
        .await?;
    Ok(())
}

fn test_config(hub: &MockHub) -> ManagerConfig {
    let mut config = ManagerConfig::new(hub.url(), static_token("tok-1"));
    config.reconnect = ReconnectPolicy::fixed(3, Duration::from_millis(10));
    config.connect_timeout = Duration::from_secs(2);
    config
}

fn record_status(
    manager: &ConnectionManager,
) -> (Disposer, mpsc::UnboundedReceiver<ConnectionState>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let disposer = manager.on_status_change(move |state| {
        let _ = tx.send(state);
    });
    (disposer, rx)
}

/// Wait until `target` shows up, returning every state seen on the way.
async fn wait_for_status(
    rx: &mut mpsc::UnboundedReceiver<ConnectionState>,
    target: ConnectionState,
) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    let reached = tokio::time::timeout(WAIT, async {
        while let Some(state) = rx.recv().await {
            seen.push(state);
            if state == target {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(reached, "never reached {target}, saw {seen:?}");
    seen
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ConnectionState>) -> Vec<ConnectionState> {
    let mut seen = Vec::new();
    while let Ok(state) = rx.try_recv() {
        seen.push(state);
    }
    seen
}

fn forward_data(
    manager: &ConnectionManager,
    channel: &str,
) -> (Disposer, mpsc::UnboundedReceiver<serde_json::Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let disposer = manager.subscribe(channel, move |msg| {
        let _ = tx.send(msg.data.clone().unwrap_or_default());
    });
    (disposer, rx)
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("sender dropped")
}

// ---------------------------------------------------------------------------
// Test 1: connect, authenticate, and fan out to the right channel
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscribe_connects_and_receives_channel_traffic() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);

    let (_reports, mut reports) = forward_data(&manager, "reports/1");
    let (_other, mut other) = forward_data(&manager, "reports/2");
    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();

    let seen = wait_for_status(&mut states, ConnectionState::Authenticated).await;
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticated,
        ]
    );
    assert_eq!(manager.debug_info().attempts, 0);

    send_json(
        &mut ws,
        serde_json::json!({"type": "message", "channel": "reports/1", "data": {"foo": 1}}),
    )
    .await
    .unwrap();
    assert_eq!(recv(&mut reports).await, serde_json::json!({"foo": 1}));
    assert!(other.try_recv().is_err());
}

// ---------------------------------------------------------------------------
// Test 2: channel-list frames replace the snapshot
// ---------------------------------------------------------------------------

#[tokio::test]
async fn channel_list_is_replaced_on_each_advertisement() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (tx, mut lists) = mpsc::unbounded_channel();
    let _lists = manager.on_channel_list_change(move |channels| {
        let _ = tx.send(channels.to_vec());
    });

    manager.connect();
    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();

    send_json(
        &mut ws,
        serde_json::json!({"type": "channels", "available_channels": ["a", "b"]}),
    )
    .await
    .unwrap();
    assert_eq!(recv(&mut lists).await, vec!["a", "b"]);
    assert!(manager.is_channel_supported("a"));

    send_json(
        &mut ws,
        serde_json::json!({"type": "channels", "available_channels": ["c"]}),
    )
    .await
    .unwrap();
    assert_eq!(recv(&mut lists).await, vec!["c"]);
    assert!(!manager.is_channel_supported("a"));
    assert!(manager.is_channel_supported("c"));
}

#[tokio::test]
async fn channel_list_before_auth_ack_is_kept() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    let mut ws = hub.accept_raw().await.unwrap();
    read_frame(&mut ws).await.unwrap();
    send_json(
        &mut ws,
        serde_json::json!({"type": "channels", "available_channels": ["early"]}),
    )
    .await
    .unwrap();
    send_json(&mut ws, serde_json::json!({"type": "auth_ack", "status": "ok"}))
        .await
        .unwrap();

    wait_for_status(&mut states, ConnectionState::Authenticated).await;
    assert!(manager.is_channel_supported("early"));
}

// ---------------------------------------------------------------------------
// Test 3: rejected credentials are terminal
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auth_rejection_is_terminal() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    let mut ws = hub.accept_raw().await.unwrap();
    read_frame(&mut ws).await.unwrap();
    send_json(
        &mut ws,
        serde_json::json!({"type": "auth_ack", "status": "error", "message": "bad token"}),
    )
    .await
    .unwrap();

    wait_for_status(&mut states, ConnectionState::AuthFailed).await;
    assert!(hub.stays_quiet().await);

    // Subscribing does not restart a failed manager.
    let _sub = manager.subscribe("a", |_| {});
    assert!(hub.stays_quiet().await);
    assert_eq!(manager.status(), ConnectionState::AuthFailed);
    let info = manager.debug_info();
    assert!(info.last_error.unwrap_or_default().contains("bad token"));
}

// ---------------------------------------------------------------------------
// Test 4: the retry budget bounds reconnects
// ---------------------------------------------------------------------------

#[tokio::test]
async fn exhausted_retries_stop_in_error() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    for _ in 0..3 {
        let ws = hub.accept_raw().await.unwrap();
        drop(ws);
    }
    assert!(hub.stays_quiet().await);

    let seen = drain(&mut states);
    let errors = seen
        .iter()
        .filter(|s| **s == ConnectionState::Error)
        .count();
    assert_eq!(errors, 3, "states: {seen:?}");
    assert_eq!(manager.status(), ConnectionState::Error);

    let info = manager.debug_info();
    assert_eq!(info.attempts, 3);
    assert!(!info.reconnect_pending);
    assert!(!info.transport_open);
}

#[tokio::test]
async fn connect_after_exhaustion_starts_a_fresh_budget() {
    let hub = MockHub::start().await.unwrap();
    let mut config = test_config(&hub);
    config.reconnect = ReconnectPolicy::fixed(1, Duration::from_millis(10));
    let manager = ConnectionManager::new(config).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    drop(hub.accept_raw().await.unwrap());
    wait_for_status(&mut states, ConnectionState::Error).await;
    assert!(hub.stays_quiet().await);

    manager.connect();
    let _ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;
    assert_eq!(manager.debug_info().attempts, 0);
}

// ---------------------------------------------------------------------------
// Test 5: at most one transport
// ---------------------------------------------------------------------------

#[tokio::test]
async fn double_connect_opens_one_transport() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();

    manager.connect();
    manager.connect();
    let _sub = manager.subscribe("a", |_| {});
    let _ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    assert!(hub.stays_quiet().await);
    assert_eq!(manager.status(), ConnectionState::Authenticated);
}

// ---------------------------------------------------------------------------
// Test 6: reconnect keeps subscribers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reconnect_after_drop_preserves_subscriptions() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);
    let (_sub, mut data) = forward_data(&manager, "a");

    let ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;
    drop(ws);

    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    let seen = wait_for_status(&mut states, ConnectionState::Authenticated).await;
    assert_eq!(seen.first(), Some(&ConnectionState::Error));
    assert_eq!(manager.debug_info().attempts, 0);

    send_json(
        &mut ws,
        serde_json::json!({"type": "message", "channel": "a", "data": "after"}),
    )
    .await
    .unwrap();
    assert_eq!(recv(&mut data).await, serde_json::json!("after"));
}

// ---------------------------------------------------------------------------
// Test 7: disconnect
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disconnect_closes_transport_and_keeps_subscriptions() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);
    let _sub = manager.subscribe("a", |_| {});

    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;

    manager.disconnect();
    assert_eq!(manager.status(), ConnectionState::Disconnected);

    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "hub never saw the connection close");
    assert!(hub.stays_quiet().await);

    let info = manager.debug_info();
    assert_eq!(info.subscriptions.get("a"), Some(&1));
    assert!(!info.transport_open);
    assert!(!manager.send(&serde_json::json!({"type": "ping"})));
}

#[tokio::test]
async fn dropping_last_handle_closes_transport() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (status, mut states) = record_status(&manager);
    let clone = manager.clone();

    manager.connect();
    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;

    // Another clone keeps the connection alive.
    drop(manager);
    assert!(clone.send(&serde_json::json!({"type": "still-here"})));
    assert_eq!(read_frame(&mut ws).await.unwrap()["type"], "still-here");

    drop(status);
    drop(clone);
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "hub never saw the connection close");
    assert!(hub.stays_quiet().await);
}

// ---------------------------------------------------------------------------
// Test 8: outbound frames
// ---------------------------------------------------------------------------

#[tokio::test]
async fn send_reaches_hub_once_authenticated() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();
    let (_status, mut states) = record_status(&manager);

    assert!(!manager.send(&serde_json::json!({"type": "early"})));
    manager.connect();
    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;

    assert!(manager.send(&serde_json::json!({"type": "subscribe", "channel": "a"})));
    let frame = read_frame(&mut ws).await.unwrap();
    assert_eq!(frame, serde_json::json!({"type": "subscribe", "channel": "a"}));
}

// ---------------------------------------------------------------------------
// Test 9: handshake timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_auth_ack_times_out() {
    let hub = MockHub::start().await.unwrap();
    let mut config = test_config(&hub);
    config.reconnect = ReconnectPolicy::fixed(1, Duration::from_millis(10));
    config.connect_timeout = Duration::from_millis(200);
    let manager = ConnectionManager::new(config).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    let mut ws = hub.accept_raw().await.unwrap();
    read_frame(&mut ws).await.unwrap();

    let seen = wait_for_status(&mut states, ConnectionState::Error).await;
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Error,
        ]
    );
    let last_error = manager.debug_info().last_error.unwrap_or_default();
    assert!(last_error.contains("timed out"), "last_error: {last_error}");
    drop(ws);
}

// ---------------------------------------------------------------------------
// Test 10: idle timeout
// ---------------------------------------------------------------------------

#[tokio::test]
async fn idle_connection_counts_as_failed_attempt() {
    let hub = MockHub::start().await.unwrap();
    let mut config = test_config(&hub);
    config.idle_timeout = Some(Duration::from_millis(200));
    let manager = ConnectionManager::new(config).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    let mut ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;

    // Pings keep the connection alive past the idle timeout.
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_millis(80)).await;
        ws.send(tungstenite::Message::Ping(Vec::new().into()))
            .await
            .unwrap();
    }
    assert_eq!(drain(&mut states), Vec::new());
    assert_eq!(manager.status(), ConnectionState::Authenticated);

    // Silence trips the timeout, and the manager reconnects.
    wait_for_status(&mut states, ConnectionState::Error).await;
    let last_error = manager.debug_info().last_error.unwrap_or_default();
    assert!(last_error.contains("idle connection"), "last_error: {last_error}");

    let _ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    let seen = wait_for_status(&mut states, ConnectionState::Authenticated).await;
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticated,
        ]
    );
    assert_eq!(manager.debug_info().attempts, 0);
    drop(ws);
}

// ---------------------------------------------------------------------------
// Test 11: listener ordering on a multi-thread runtime
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn status_listeners_see_transitions_in_order() {
    let hub = MockHub::start().await.unwrap();
    let manager = ConnectionManager::new(test_config(&hub)).unwrap();

    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let s = seen.clone();
    let _status = manager.on_status_change(move |state| {
        if state == ConnectionState::Connecting {
            // A slow listener must not let later transitions overtake it.
            std::thread::sleep(Duration::from_millis(300));
        }
        s.lock().unwrap().push(state);
    });

    let handle = manager.clone();
    let connecting = tokio::task::spawn_blocking(move || handle.connect());
    let _ws = hub.accept_and_authenticate("tok-1").await.unwrap();
    connecting.await.unwrap();

    tokio::time::timeout(WAIT, async {
        while seen.lock().unwrap().len() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listener never saw Authenticated");

    let seen = seen.lock().unwrap().clone();
    assert_eq!(
        seen,
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Authenticated,
        ]
    );
    assert_eq!(seen.last(), Some(&manager.status()));
}

// ---------------------------------------------------------------------------
// Test 12: settings file and HTTP token endpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn settings_file_drives_token_fetch_and_auth() {
    let hub = MockHub::start().await.unwrap();
    let http = MockServer::start_async().await;
    let token_mock = http
        .mock_async(|when, then| {
            when.method(POST).path("/token");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"token": "from-http"}));
        })
        .await;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        concat!(
            "url: {}\ntoken_url: {}\n",
            "timing:\n  max_attempts: 2\n  backoff: fixed\n  initial_delay_ms: 10\n",
        ),
        hub.url(),
        http.url("/token"),
    )
    .unwrap();

    let settings = config::load(file.path()).await.unwrap();
    let manager = ConnectionManager::new(ManagerConfig::from_settings(&settings).unwrap()).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    let _ws = hub.accept_and_authenticate("from-http").await.unwrap();
    wait_for_status(&mut states, ConnectionState::Authenticated).await;
    token_mock.assert_async().await;
    assert_eq!(manager.debug_info().max_attempts, 2);
}

#[tokio::test]
async fn token_endpoint_failure_counts_as_failed_attempt() {
    let hub = MockHub::start().await.unwrap();
    let http = MockServer::start_async().await;
    http.mock_async(|when, then| {
        when.method(POST).path("/token");
        then.status(503);
    })
    .await;

    let token_url = Url::parse(&http.url("/token")).unwrap();
    let provider = HttpTokenProvider::new(token_url).unwrap().into_provider();
    let mut config = ManagerConfig::new(hub.url(), provider);
    config.reconnect = ReconnectPolicy::fixed(2, Duration::from_millis(10));
    let manager = ConnectionManager::new(config).unwrap();
    let (_status, mut states) = record_status(&manager);

    manager.connect();
    wait_for_status(&mut states, ConnectionState::Error).await;
    wait_for_status(&mut states, ConnectionState::Error).await;
    assert!(hub.stays_quiet().await);
    assert_eq!(manager.debug_info().attempts, 2);
    let last_error = manager.debug_info().last_error.unwrap_or_default();
    assert!(last_error.contains("token fetch failed"), "last_error: {last_error}");
}

// ---------------------------------------------------------------------------
// Test 13: legacy per-feature socket
// ---------------------------------------------------------------------------

fn counting_fetch(counter: &Arc<AtomicUsize>) -> FetchFn {
    let counter = counter.clone();
    Arc::new(move || -> FetchFuture {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), channel_mux::BoxError>(())
        })
    })
}

async fn wait_for_count(counter: &AtomicUsize, target: usize) {
    tokio::time::timeout(WAIT, async {
        while counter.load(Ordering::SeqCst) < target {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("count never reached {target}"));
}

#[tokio::test]
async fn legacy_socket_refetches_on_every_frame() {
    let hub = MockHub::start().await.unwrap();
    let fetches = Arc::new(AtomicUsize::new(0));
    let socket = LegacyFeatureSocket::mount(LegacySocketConfig::new(
        hub.url(),
        counting_fetch(&fetches),
        3,
        Duration::from_millis(10),
    ))
    .unwrap();

    let mut ws = hub.accept_raw().await.unwrap();
    wait_for_count(&fetches, 1).await;

    send_json(&mut ws, serde_json::json!({"type": "changed"}))
        .await
        .unwrap();
    wait_for_count(&fetches, 2).await;
    ws.send(tungstenite::Message::Binary(vec![1u8].into()))
        .await
        .unwrap();
    wait_for_count(&fetches, 3).await;

    socket.unmount();
    let closed = tokio::time::timeout(WAIT, async {
        loop {
            match ws.next().await {
                Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_)) => return,
                Some(Ok(_)) => {}
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "unmount did not close the socket");
    assert!(hub.stays_quiet().await);
    assert_eq!(fetches.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn legacy_socket_reconnects_within_shared_budget() {
    let hub = MockHub::start().await.unwrap();
    let fetches = Arc::new(AtomicUsize::new(0));
    let config = LegacySocketConfig::new(
        hub.url(),
        counting_fetch(&fetches),
        2,
        Duration::from_millis(10),
    );
    let attempts = config.attempts.clone();
    let socket = LegacyFeatureSocket::mount(config).unwrap();

    // Initial open plus two reconnects.
    for _ in 0..3 {
        let mut ws = hub.accept_raw().await.unwrap();
        ws.close(None).await.unwrap();
    }
    assert!(hub.stays_quiet().await);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert!(socket.is_finished());
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn legacy_socket_fetches_from_rest_endpoint() {
    let hub = MockHub::start().await.unwrap();
    let http = MockServer::start_async().await;
    let report = http
        .mock_async(|when, then| {
            when.method(GET).path("/reports/1");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({"id": 1, "state": "done"}));
        })
        .await;

    let client = reqwest::Client::new();
    let url = http.url("/reports/1");
    let fetch: FetchFn = Arc::new(move || -> FetchFuture {
        let client = client.clone();
        let url = url.clone();
        Box::pin(async move {
            client.get(url).send().await?.error_for_status()?;
            Ok::<(), channel_mux::BoxError>(())
        })
    });
    let socket = LegacyFeatureSocket::mount(LegacySocketConfig::new(
        hub.url(),
        fetch,
        1,
        Duration::from_millis(10),
    ))
    .unwrap();

    let mut ws = hub.accept_raw().await.unwrap();
    send_json(&mut ws, serde_json::json!({"type": "report_updated"}))
        .await
        .unwrap();

    tokio::time::timeout(WAIT, async {
        while report.hits_async().await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("invalidation never reached the REST endpoint");
    drop(socket);
}
