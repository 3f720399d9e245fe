use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::time::timeout;

use super::*;
use crate::config::Config;
use crate::protocol::Envelope;
use crate::recovery::{RecoveryKey, RecoveryStore};
use crate::router::{MessageHandler, MessageRouter};
use crate::transport::{MemoryConnector, MemoryListener, MemoryServerSocket};

const TIMEOUT: Duration = Duration::from_secs(2);

fn test_config() -> Config {
    let mut config = Config::default();
    config.endpoint.host = "backend.test".to_string();
    config.endpoint.secure = false;
    config.session.retry_delay_ms = 10;
    config.session.reconnect_base_delay_ms = 10;
    config.session.reconnect_max_delay_ms = 40;
    config.recovery.enabled = false;
    config
}

struct Harness {
    conn: Connection,
    connector: Arc<MemoryConnector>,
    listener: MemoryListener,
    server: MemoryServerSocket,
    events: broadcast::Receiver<SessionEvent>,
}

async fn harness(config: Config) -> Harness {
    harness_with_router(config, MessageRouter::new()).await
}

async fn harness_with_router(config: Config, router: MessageRouter) -> Harness {
    let (connector, mut listener) = MemoryConnector::new();
    let conn = Connection::start_with_router(&config, connector.clone(), router);
    let events = conn.subscribe();
    let server = accept(&mut listener).await;
    Harness {
        conn,
        connector,
        listener,
        server,
        events,
    }
}

async fn accept(listener: &mut MemoryListener) -> MemoryServerSocket {
    timeout(TIMEOUT, listener.accept())
        .await
        .expect("timed out waiting for socket")
        .expect("listener closed")
}

async fn recv(server: &mut MemoryServerSocket) -> Envelope {
    timeout(TIMEOUT, server.recv_envelope())
        .await
        .expect("timed out waiting for frame")
        .expect("client hung up")
}

async fn expect_event(events: &mut broadcast::Receiver<SessionEvent>, wanted: SessionEvent) {
    let found = timeout(TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(event) if event == wanted => return,
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await;
    assert!(found.is_ok(), "timed out waiting for {:?}", wanted);
}

async fn establish(h: &mut Harness, session_id: &str) {
    h.server
        .send_json(json!({"route": "websocketclient", "type": "initialize", "sessionID": session_id}))
        .unwrap();
    expect_event(
        &mut h.events,
        SessionEvent::Established {
            session_id: session_id.to_string(),
        },
    )
    .await;
}

/// Approve a login and consume the keepalive it triggers
async fn approve(h: &mut Harness, token: &str) {
    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "auth",
            "subComponent": "approved",
            "token": token,
        }))
        .unwrap();
    expect_event(&mut h.events, SessionEvent::AuthComplete { is_admin: false }).await;

    let keepalive = recv(&mut h.server).await;
    assert_eq!(keepalive.kind, "keepalive");
}

fn seeds(kind: &str) -> Envelope {
    Envelope::new("seeds", kind).component(kind)
}

fn channel_handler() -> (Arc<dyn MessageHandler>, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler: Arc<dyn MessageHandler> = Arc::new(move |envelope: &Envelope| {
        let _ = tx.send(envelope.clone());
    });
    (handler, rx)
}

#[tokio::test]
async fn test_initialize_makes_session_ready() {
    let mut h = harness(test_config()).await;
    assert_eq!(h.server.url(), "ws://backend.test/ws/v1.0.0");

    h.conn
        .wait_for(|s| s.state == ConnectionState::Authenticating)
        .await
        .unwrap();

    establish(&mut h, "S1").await;

    let snapshot = h.conn.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Ready);
    assert_eq!(snapshot.credentials.session_id.as_deref(), Some("S1"));
    assert!(!snapshot.credentials.is_authenticated());
    assert_eq!(snapshot.sockets_opened, 1);
}

#[tokio::test]
async fn test_sends_before_initialize_flush_in_order() {
    let mut h = harness(test_config()).await;

    h.conn.send(seeds("first")).unwrap();
    h.conn.send(seeds("second")).unwrap();
    h.conn.send(seeds("third")).unwrap();
    h.conn.wait_for(|s| s.pending_sends == 3).await.unwrap();

    establish(&mut h, "S1").await;

    for kind in ["first", "second", "third"] {
        let envelope = recv(&mut h.server).await;
        assert_eq!(envelope.kind, kind);
        assert_eq!(envelope.session_id.as_deref(), Some("S1"));
        assert!(envelope.timestamp.is_some());
    }

    assert_eq!(h.conn.snapshot().pending_sends, 0);
    assert_eq!(h.connector.connect_count(), 1);
}

#[tokio::test]
async fn test_approval_stores_token_and_emits_once() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "auth",
            "subComponent": "approved",
            "token": "T1",
            "isAdmin": true,
        }))
        .unwrap();
    expect_event(&mut h.events, SessionEvent::AuthComplete { is_admin: true }).await;

    let keepalive = recv(&mut h.server).await;
    assert_eq!(keepalive.route, "websocketclient");
    assert_eq!(keepalive.kind, "keepalive");
    assert_eq!(keepalive.component.as_deref(), Some("active"));
    assert_eq!(keepalive.token.as_deref(), Some("T1"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut completions = 0;
    while let Ok(event) = h.events.try_recv() {
        if matches!(event, SessionEvent::AuthComplete { .. }) {
            completions += 1;
        }
    }
    assert_eq!(completions, 0);
    assert_eq!(
        h.conn.snapshot().credentials.access_token.as_deref(),
        Some("T1")
    );
}

#[tokio::test]
async fn test_approval_before_initialize_arms_keepalive_later() {
    let mut h = harness(test_config()).await;

    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "auth",
            "component": "approved",
            "token": "T1",
        }))
        .unwrap();
    expect_event(&mut h.events, SessionEvent::AuthComplete { is_admin: false }).await;
    assert_eq!(h.conn.state(), ConnectionState::Authenticating);

    establish(&mut h, "S1").await;

    let keepalive = recv(&mut h.server).await;
    assert_eq!(keepalive.kind, "keepalive");
    assert_eq!(keepalive.token.as_deref(), Some("T1"));
    assert_eq!(keepalive.session_id.as_deref(), Some("S1"));
}

#[tokio::test]
async fn test_credentials_overwrite_caller_fields() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    let mut forged = seeds("getInventory");
    forged.token = Some("forged".to_string());
    forged.session_id = Some("forged".to_string());
    forged.refresh_token = Some("forged".to_string());
    h.conn.send(forged).unwrap();

    let sent = recv(&mut h.server).await;
    assert_eq!(sent.token.as_deref(), Some("T1"));
    assert_eq!(sent.session_id.as_deref(), Some("S1"));
    assert_eq!(sent.refresh_token, None);

    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "auth",
            "subComponent": "refresh",
            "refreshToken": "R1",
        }))
        .unwrap();
    h.conn
        .wait_for(|s| s.credentials.refresh_token.as_deref() == Some("R1"))
        .await
        .unwrap();

    h.conn.send(seeds("getInventory")).unwrap();
    let sent = recv(&mut h.server).await;
    assert_eq!(sent.refresh_token.as_deref(), Some("R1"));
}

#[tokio::test]
async fn test_server_close_clears_credentials() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    h.server.close(1008);
    expect_event(&mut h.events, SessionEvent::Closed { code: 1008 }).await;

    let snapshot = h.conn.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.credentials.is_empty());
}

#[tokio::test]
async fn test_send_after_close_opens_one_socket() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;
    h.server.close(1000);
    expect_event(&mut h.events, SessionEvent::Closed { code: 1000 }).await;

    h.conn.send(seeds("first")).unwrap();
    h.conn.send(seeds("second")).unwrap();
    h.conn.send(seeds("third")).unwrap();

    let mut server = accept(&mut h.listener).await;
    server
        .send_json(json!({"route": "websocketclient", "type": "initialize", "sessionID": "S2"}))
        .unwrap();

    for kind in ["first", "second", "third"] {
        let envelope = recv(&mut server).await;
        assert_eq!(envelope.kind, kind);
        assert_eq!(envelope.session_id.as_deref(), Some("S2"));
        assert_eq!(envelope.token, None);
    }

    assert_eq!(h.connector.connect_count(), 2);
    assert!(h.listener.try_accept().is_none());
}

#[tokio::test]
async fn test_denial_tears_down() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "auth",
            "subComponent": "denied",
            "error": "bad password",
        }))
        .unwrap();

    expect_event(
        &mut h.events,
        SessionEvent::Notice {
            route: "websocketclient".to_string(),
            message: "bad password".to_string(),
        },
    )
    .await;
    expect_event(&mut h.events, SessionEvent::Closed { code: 1000 }).await;

    let hung_up = timeout(TIMEOUT, h.server.recv_text()).await.unwrap();
    assert_eq!(hung_up, None);
    assert!(h.conn.snapshot().credentials.is_empty());
}

#[tokio::test]
async fn test_unknown_control_kind_tears_down() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({"route": "websocketclient", "type": "bogus"}))
        .unwrap();
    expect_event(&mut h.events, SessionEvent::Closed { code: 1000 }).await;
    assert_eq!(h.conn.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_initialize_without_session_id_is_ignored() {
    let mut h = harness(test_config()).await;

    h.server
        .send_json(json!({"route": "websocketclient", "type": "initialize"}))
        .unwrap();
    h.server
        .send_json(json!({"route": "WebSocketClient", "type": "Initialize", "sessionID": "S2"}))
        .unwrap();

    let first = timeout(TIMEOUT, h.events.recv()).await.unwrap().unwrap();
    assert_eq!(
        first,
        SessionEvent::Established {
            session_id: "S2".to_string()
        }
    );
}

#[tokio::test]
async fn test_feature_routes_dispatch_to_handlers() {
    let (handler, mut received) = channel_handler();
    let mut router = MessageRouter::new();
    router.register("seeds", handler);

    let mut h = harness_with_router(test_config(), router).await;
    establish(&mut h, "S1").await;

    // unknown routes are dropped without disturbing the session
    h.server
        .send_json(json!({"route": "nowhere", "type": "x"}))
        .unwrap();
    h.server
        .send_json(json!({"route": "Seeds", "type": "inventory", "data": [{"name": "basil"}]}))
        .unwrap();

    let envelope = timeout(TIMEOUT, received.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.kind, "inventory");
    assert_eq!(envelope.data, Some(json!([{"name": "basil"}])));
    assert_eq!(h.conn.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_reregistration_replaces_handler() {
    let mut h = harness(test_config()).await;
    let (first, mut first_rx) = channel_handler();
    let (second, mut second_rx) = channel_handler();

    h.conn.register_handler("seeds", first).unwrap();
    h.conn.register_handler("seeds", second).unwrap();
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({"route": "seeds", "type": "inventory"}))
        .unwrap();

    let envelope = timeout(TIMEOUT, second_rx.recv()).await.unwrap().unwrap();
    assert_eq!(envelope.kind, "inventory");
    assert!(first_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_error_frame_becomes_notice() {
    let mut h = harness(test_config()).await;
    let (handler, mut received) = channel_handler();
    h.conn.register_handler("seeds", handler).unwrap();
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({"route": "seeds", "type": "inventory", "error": "no access"}))
        .unwrap();
    expect_event(
        &mut h.events,
        SessionEvent::Notice {
            route: "seeds".to_string(),
            message: "no access".to_string(),
        },
    )
    .await;

    assert!(received.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_send_is_retried() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.connector.fail_next_sends(1);
    h.conn.send(seeds("getInventory")).unwrap();

    let sent = recv(&mut h.server).await;
    assert_eq!(sent.kind, "getInventory");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.server.try_recv_text().is_none());
}

#[tokio::test]
async fn test_retries_stop_at_cap() {
    let mut config = test_config();
    config.session.max_send_attempts = 3;
    let mut h = harness(config).await;
    establish(&mut h, "S1").await;

    h.connector.fail_next_sends(100);
    h.conn.send(seeds("getInventory")).unwrap();

    expect_event(
        &mut h.events,
        SessionEvent::SendFailed {
            route: "seeds".to_string(),
            kind: "getInventory".to_string(),
            attempts: 3,
        },
    )
    .await;
    h.connector.fail_next_sends(0);
    assert!(h.server.try_recv_text().is_none());
}

#[tokio::test]
async fn test_keepalive_stops_after_close() {
    let mut config = test_config();
    config.session.keepalive_interval_ms = 30;
    let mut h = harness(config).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    let next = recv(&mut h.server).await;
    assert_eq!(next.kind, "keepalive");

    h.server.close(1000);
    expect_event(&mut h.events, SessionEvent::Closed { code: 1000 }).await;

    tokio::time::sleep(Duration::from_millis(120)).await;
    assert_eq!(h.connector.connect_count(), 1);
    assert!(h.listener.try_accept().is_none());
}

#[tokio::test]
async fn test_server_keepalive_is_ignored() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({"route": "websocketclient", "type": "keepalive"}))
        .unwrap();
    h.server
        .send_json(json!({"route": "websocketclient", "type": "initialize", "sessionID": "S1"}))
        .unwrap();

    expect_event(
        &mut h.events,
        SessionEvent::Established {
            session_id: "S1".to_string(),
        },
    )
    .await;
    assert_eq!(h.conn.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_login_and_pagelet_requests() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;

    h.conn.login("admin", "secret").unwrap();
    let login = recv(&mut h.server).await;
    assert_eq!(login.route, "websocketclient");
    assert_eq!(login.kind, "auth");
    assert_eq!(login.component.as_deref(), Some("authenticate"));
    let auth = login.authentication.unwrap();
    assert_eq!(auth.id, "admin");
    assert_eq!(auth.password, "secret");

    h.conn.get_pagelet("seeds").unwrap();
    let pagelet = recv(&mut h.server).await;
    assert_eq!(pagelet.kind, "getPagelet");
    assert_eq!(pagelet.component.as_deref(), Some("seeds"));
}

#[tokio::test]
async fn test_pagelet_navigates_and_stores_key() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("last-page.json");
    let mut config = test_config();
    config.recovery.enabled = true;
    config.recovery.file = file.to_string_lossy().to_string();

    let mut h = harness(config).await;
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({
            "route": "websocketclient",
            "type": "getPagelet",
            "component": "seeds",
            "data": "<div>seeds</div>",
        }))
        .unwrap();
    expect_event(
        &mut h.events,
        SessionEvent::Navigated {
            component: "seeds".to_string(),
            fragment: Some(json!("<div>seeds</div>")),
        },
    )
    .await;

    assert_eq!(h.conn.snapshot().location, "/seeds");
    let store = RecoveryStore::new(&file);
    assert_eq!(store.load().unwrap().unwrap().page_type, "seeds");

    h.server
        .send_json(json!({"route": "websocketclient", "type": "getPagelet", "error": "forbidden"}))
        .unwrap();
    expect_event(
        &mut h.events,
        SessionEvent::Notice {
            route: "websocketclient".to_string(),
            message: "forbidden".to_string(),
        },
    )
    .await;

    assert_eq!(h.conn.snapshot().location, "/");
    assert_eq!(store.load().unwrap().unwrap().page_type, "home");
}

#[tokio::test]
async fn test_restore_last_page_after_login() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("last-page.json");
    RecoveryStore::new(&file)
        .save(&RecoveryKey::now("admin"))
        .unwrap();

    let mut config = test_config();
    config.recovery.enabled = true;
    config.recovery.restore_on_auth = true;
    config.recovery.file = file.to_string_lossy().to_string();

    let mut h = harness(config).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    let restore = recv(&mut h.server).await;
    assert_eq!(restore.kind, "getPagelet");
    assert_eq!(restore.component.as_deref(), Some("admin"));
    assert_eq!(restore.token.as_deref(), Some("T1"));
}

#[tokio::test]
async fn test_refused_connect_reports_abnormal_close() {
    let (connector, _listener) = MemoryConnector::new();
    connector.refuse_connections(true);

    let conn = Connection::start(&test_config(), connector.clone());
    let mut events = conn.subscribe();

    expect_event(&mut events, SessionEvent::Closed { code: 1006 }).await;
    let snapshot = conn.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.credentials.is_empty());

    // nothing queued, so no reconnect
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert_eq!(connector.connect_count(), 1);
}

#[tokio::test]
async fn test_queued_sends_trigger_reconnect() {
    let mut config = test_config();
    config.session.reconnect_base_delay_ms = 100;
    config.session.reconnect_max_delay_ms = 400;

    let (connector, mut listener) = MemoryConnector::new();
    connector.refuse_connections(true);
    let conn = Connection::start(&config, connector.clone());
    let mut events = conn.subscribe();
    expect_event(&mut events, SessionEvent::Closed { code: 1006 }).await;

    conn.send(seeds("getInventory")).unwrap();
    expect_event(&mut events, SessionEvent::Closed { code: 1006 }).await;
    connector.refuse_connections(false);

    let mut server = accept(&mut listener).await;
    server
        .send_json(json!({"route": "websocketclient", "type": "initialize", "sessionID": "S3"}))
        .unwrap();

    let sent = recv(&mut server).await;
    assert_eq!(sent.kind, "getInventory");
    assert_eq!(sent.session_id.as_deref(), Some("S3"));
    assert!(connector.connect_count() >= 3);
}

#[tokio::test]
async fn test_close_stops_connection() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    h.conn.close().unwrap();
    expect_event(&mut h.events, SessionEvent::Closed { code: 1001 }).await;

    let snapshot = h.conn.wait_for(|s| s.terminated).await.unwrap();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.credentials.is_empty());

    let hung_up = timeout(TIMEOUT, h.server.recv_text()).await.unwrap();
    assert_eq!(hung_up, None);
}

#[tokio::test]
async fn test_transport_error_tears_down() {
    let mut h = harness(test_config()).await;
    establish(&mut h, "S1").await;
    approve(&mut h, "T1").await;

    h.server.send_error("connection reset").unwrap();
    expect_event(&mut h.events, SessionEvent::Closed { code: 1006 }).await;

    let snapshot = h.conn.snapshot();
    assert_eq!(snapshot.state, ConnectionState::Disconnected);
    assert!(snapshot.credentials.is_empty());

    // the next send goes out on a fresh socket without the old credentials
    h.conn.send(seeds("getInventory")).unwrap();
    let mut server = accept(&mut h.listener).await;
    server
        .send_json(json!({"route": "websocketclient", "type": "initialize", "sessionID": "S2"}))
        .unwrap();
    let sent = recv(&mut server).await;
    assert_eq!(sent.session_id.as_deref(), Some("S2"));
    assert_eq!(sent.token, None);
}

#[tokio::test]
async fn test_handler_panic_keeps_connection_alive() {
    let mut h = harness(test_config()).await;
    let failing: Arc<dyn MessageHandler> = Arc::new(|_: &Envelope| panic!("feature bug"));
    h.conn.register_handler("seeds", failing).unwrap();
    establish(&mut h, "S1").await;

    h.server
        .send_json(json!({"route": "seeds", "type": "inventory"}))
        .unwrap();
    h.conn.send(seeds("getInventory")).unwrap();

    let sent = recv(&mut h.server).await;
    assert_eq!(sent.kind, "getInventory");
    assert_eq!(h.conn.state(), ConnectionState::Ready);
}
