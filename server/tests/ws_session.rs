//! End-to-end duplex session tests: a real axum server bound to a loopback
//! port, driven by a `tokio-tungstenite` client, against a real Postgres
//! instance. Grounded in the teacher pack's own in-process-server-plus-
//! tungstenite-client test idiom (see `rt-test-utils`/`session_loop.rs` in
//! the `iwismer-rusty-timer` example repo); the database fixture setup
//! mirrors this crate's own `db_tests.rs`.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use para_ws_server::auth::JwtVerifier;
use para_ws_server::config::{Config, LlmConfig};
use para_ws_server::db::{self, DbConfig, DbPool};
use para_ws_server::models::Frame;
use para_ws_server::notifier::InMemoryNotifier;
use para_ws_server::{realtime, AppState};
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

const JWT_SECRET: &str = "test-ws-session-secret";

async fn setup_test_db() -> PgPool {
    let database_url = std::env::var("TEST_DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost/para_test".to_string());

    let config = DbConfig {
        database_url,
        max_connections: 10,
        min_connections: 2,
        acquire_timeout: Duration::from_secs(30),
        idle_timeout: Duration::from_secs(600),
    };

    db::init_db(config)
        .await
        .expect("failed to initialize test database")
}

async fn cleanup_test_data(pool: &PgPool) {
    sqlx::query(
        "TRUNCATE TABLE ws_events, ws_device_cursors, ws_streams, llm_usage_events, saves CASCADE",
    )
    .execute(pool)
    .await
    .expect("failed to clean up test data");
}

async fn insert_save(pool: &PgPool, id: &str, user_id: &str) {
    sqlx::query("INSERT INTO saves (id, user_id, name, created_at) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(user_id)
        .bind("test save")
        .bind(chrono::Utc::now())
        .execute(pool)
        .await
        .expect("failed to insert save fixture");
}

fn test_config(max_devices_per_save: i64) -> Config {
    Config {
        database_url: String::new(),
        db_max_connections: 10,
        db_min_connections: 1,
        jwt_secret: JWT_SECRET.to_string(),
        redis_url: None,
        ws_max_device_id_length: 200,
        ws_max_devices_per_save: max_devices_per_save,
        llm: LlmConfig {
            mode: "fake".to_string(),
            base_url: None,
            api_key: None,
            model: "fake".to_string(),
            api: "auto".to_string(),
            total_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
        },
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
    }
}

/// Stands up a real `/ws/v1` server on a loopback port and returns its
/// address plus the pool/state it's backed by, so tests can both drive the
/// socket and assert against the log directly.
async fn spawn_server(pool: DbPool, max_devices_per_save: i64) -> (SocketAddr, AppState) {
    let state = AppState {
        db: pool,
        notifier: Arc::new(InMemoryNotifier::new()),
        jwt: Arc::new(JwtVerifier::new(JWT_SECRET)),
        config: Arc::new(test_config(max_devices_per_save)),
    };

    let app = Router::new()
        .route("/ws/v1", get(realtime::ws_handler))
        .with_state(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, state)
}

async fn connect(
    addr: SocketAddr,
    token: &str,
    save_id: &str,
    resume_from: i64,
    device_id: &str,
) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tokio_tungstenite::tungstenite::Error,
> {
    let url = format!(
        "ws://{addr}/ws/v1?save_id={save_id}&resume_from={resume_from}&device_id={device_id}"
    );
    let mut req = url.into_client_request().unwrap();
    req.headers_mut().insert(
        "authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    tokio_tungstenite::connect_async(req)
        .await
        .map(|(stream, _)| stream)
}

async fn recv_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
) -> Frame {
    loop {
        let msg = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("socket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame did not parse");
        }
    }
}

#[tokio::test]
async fn basic_replay_delivers_hello_then_events_in_order() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;
    insert_save(&pool, "ws-save-1", "ws-user-1").await;
    for i in 0..5 {
        db::append_event(&pool, "ws-user-1", "ws-save-1", serde_json::json!({ "n": i }))
            .await
            .unwrap();
    }

    let (addr, state) = spawn_server(pool, 8).await;
    let token = state.jwt.issue("ws-user-1", 900).unwrap();

    let mut ws = connect(addr, &token, "ws-save-1", 0, "device-a")
        .await
        .expect("connect should succeed");

    let hello = recv_frame(&mut ws).await;
    assert_eq!(hello.frame_type, "HELLO");
    assert_eq!(hello.seq, 0);
    assert_eq!(hello.cursor, 0);

    for expected_seq in 1..=5 {
        let frame = recv_frame(&mut ws).await;
        assert_eq!(frame.frame_type, "EVENT");
        assert_eq!(frame.seq, expected_seq);
        assert_eq!(
            frame.server_event_id,
            Some(format!("ws-user-1:ws-save-1:{expected_seq}"))
        );
    }
}

#[tokio::test]
async fn per_device_trim_hides_acked_events_but_not_for_other_devices() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;
    insert_save(&pool, "ws-save-2", "ws-user-2").await;
    for i in 0..5 {
        db::append_event(&pool, "ws-user-2", "ws-save-2", serde_json::json!({ "n": i }))
            .await
            .unwrap();
    }

    let (addr, state) = spawn_server(pool, 8).await;
    let token = state.jwt.issue("ws-user-2", 900).unwrap();

    // Device A connects, replays everything, then acks cursor=3.
    let mut a1 = connect(addr, &token, "ws-save-2", 0, "device-a")
        .await
        .unwrap();
    let hello_a1 = recv_frame(&mut a1).await;
    assert_eq!(hello_a1.cursor, 0);
    for _ in 1..=5 {
        recv_frame(&mut a1).await;
    }
    a1.send(Message::Text(r#"{"type":"ACK","cursor":3}"#.into()))
        .await
        .unwrap();
    // PING/PONG round-trip after the ACK is a deterministic signal that the
    // ack (and any trim) committed before we act on it, since one session's
    // inbound frames are handled strictly in order.
    a1.send(Message::Text(r#"{"type":"PING"}"#.into()))
        .await
        .unwrap();
    let pong = recv_frame(&mut a1).await;
    assert_eq!(pong.frame_type, "PONG");
    assert_eq!(pong.cursor, 3);
    drop(a1);

    // Device A reconnects from scratch: HELLO reports cursor=3, and only
    // events 4..5 are replayed (1..3 may already be trimmed).
    let mut a2 = connect(addr, &token, "ws-save-2", 0, "device-a")
        .await
        .unwrap();
    let hello_a2 = recv_frame(&mut a2).await;
    assert_eq!(hello_a2.cursor, 3);
    let first = recv_frame(&mut a2).await;
    assert_eq!(first.seq, 4);
    let second = recv_frame(&mut a2).await;
    assert_eq!(second.seq, 5);
    drop(a2);

    // Device B, which never acked, still sees everything from the start.
    let mut b = connect(addr, &token, "ws-save-2", 0, "device-b")
        .await
        .unwrap();
    let hello_b = recv_frame(&mut b).await;
    assert_eq!(hello_b.cursor, 0);
    for expected_seq in 1..=5 {
        let frame = recv_frame(&mut b).await;
        assert_eq!(frame.seq, expected_seq);
    }
}

#[tokio::test]
async fn ownership_guard_closes_before_hello_for_non_owner() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;
    insert_save(&pool, "ws-save-3", "owner").await;

    let (addr, state) = spawn_server(pool, 8).await;
    let intruder_token = state.jwt.issue("not-the-owner", 900).unwrap();

    let mut ws = connect(addr, &intruder_token, "ws-save-3", 0, "device-a")
        .await
        .expect("the WS upgrade itself still succeeds; rejection is a close frame");

    let msg = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for close")
        .expect("stream ended without a message")
        .expect("socket error");
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected a 1008 close frame, got {other:?}"),
    }
}

#[tokio::test]
async fn device_cap_rejects_a_third_new_device_but_allows_reconnects() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;
    insert_save(&pool, "ws-save-4", "ws-user-4").await;

    let (addr, state) = spawn_server(pool, 2).await;
    let token = state.jwt.issue("ws-user-4", 900).unwrap();

    let mut d1 = connect(addr, &token, "ws-save-4", 0, "device-1")
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut d1).await.frame_type, "HELLO");

    let mut d2 = connect(addr, &token, "ws-save-4", 0, "device-2")
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut d2).await.frame_type, "HELLO");

    // A third, never-seen device id is over the cap of 2.
    let mut d3 = connect(addr, &token, "ws-save-4", 0, "device-3")
        .await
        .unwrap();
    let msg = timeout(Duration::from_secs(5), d3.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    match msg {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected a 1008 close frame, got {other:?}"),
    }

    // Reconnecting an already-known device still succeeds even while at cap.
    drop(d1);
    let mut d1_again = connect(addr, &token, "ws-save-4", 0, "device-1")
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut d1_again).await.frame_type, "HELLO");
}

#[tokio::test]
async fn chat_send_streams_tokens_then_done_with_usage_persisted_first() {
    let pool = setup_test_db().await;
    cleanup_test_data(&pool).await;
    insert_save(&pool, "ws-save-5", "ws-user-5").await;

    let (addr, state) = spawn_server(pool.clone(), 8).await;
    let token = state.jwt.issue("ws-user-5", 900).unwrap();

    let mut ws = connect(addr, &token, "ws-save-5", 0, "device-a")
        .await
        .unwrap();
    assert_eq!(recv_frame(&mut ws).await.frame_type, "HELLO");

    ws.send(Message::Text(
        r#"{"type":"CHAT_SEND","payload":{"text":"hi","client_request_id":"req-1"}}"#.into(),
    ))
    .await
    .unwrap();

    let mut saw_token = false;
    loop {
        let frame = recv_frame(&mut ws).await;
        if frame.frame_type == "CHAT_TOKEN" {
            saw_token = true;
            let payload = frame.payload.unwrap();
            assert_eq!(payload["client_request_id"], "req-1");
        } else if frame.frame_type == "CHAT_DONE" {
            let payload = frame.payload.unwrap();
            assert_eq!(payload["interrupted"], false);
            assert_eq!(payload["client_request_id"], "req-1");
            assert!(payload["error"].is_null());
            break;
        }
    }
    assert!(saw_token, "expected at least one CHAT_TOKEN before CHAT_DONE");

    let usage_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM llm_usage_events WHERE user_id = $1 AND save_id = $2",
    )
    .bind("ws-user-5")
    .bind("ws-save-5")
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(usage_count, 1);
}
