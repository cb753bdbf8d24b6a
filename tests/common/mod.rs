// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Common test utilities for relay integration tests.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use chatterbox_relay::connection_registry::DuplicateLoginPolicy;
use chatterbox_relay::dispatch::{self, DispatchHandle};
use chatterbox_relay::handler::ConnectionDeps;
use chatterbox_relay::metrics::RelayMetrics;
use chatterbox_relay::server::{self, ServerSettings};
use chatterbox_relay::storage::{ChatStore, MemoryStore};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Users seeded into every test relay. Password is `<name>-pw`.
pub const SEEDED_USERS: [&str; 3] = ["alice", "bob", "carol"];

/// A relay running on a loopback port with an inspectable store.
pub struct TestRelay {
    pub url: String,
    pub store: Arc<MemoryStore>,
    pub dispatch: DispatchHandle,
    pub metrics: RelayMetrics,
}

/// Starts a relay with default limits and the given duplicate-login policy.
#[allow(dead_code)]
pub async fn start_relay(policy: DuplicateLoginPolicy) -> TestRelay {
    start_relay_with(policy, 256, 100).await
}

/// Starts a relay with a custom outbound queue capacity and connection cap.
pub async fn start_relay_with(
    policy: DuplicateLoginPolicy,
    outbound_capacity: usize,
    max_connections: usize,
) -> TestRelay {
    let store = Arc::new(MemoryStore::new());
    for name in SEEDED_USERS {
        store
            .register(name, &password_for(name), &format!("{}-pk", name))
            .unwrap();
    }

    let metrics = RelayMetrics::new();
    let (dispatch, _task) = dispatch::spawn(policy, metrics.clone(), store.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = format!("ws://127.0.0.1:{}", addr.port());

    let deps = ConnectionDeps {
        store: store.clone(),
        dispatch: dispatch.clone(),
        metrics: metrics.clone(),
        outbound_capacity,
        max_message_size: 65_536,
        rate_limit_per_min: 0,
    };
    let settings = ServerSettings {
        max_connections,
        upgrade_timeout: Duration::from_secs(5),
    };
    tokio::spawn(server::serve(listener, deps, settings));

    TestRelay {
        url,
        store,
        dispatch,
        metrics,
    }
}

pub fn password_for(name: &str) -> String {
    format!("{}-pw", name)
}

/// Opens a WebSocket without authenticating.
pub async fn connect(relay: &TestRelay) -> Ws {
    let (ws, _) = connect_async(&relay.url).await.unwrap();
    ws
}

/// Opens a WebSocket and completes the handshake as `name`.
#[allow(dead_code)]
pub async fn connect_as(relay: &TestRelay, name: &str) -> Ws {
    let mut ws = connect(relay).await;
    let reply = login(&mut ws, name, &password_for(name)).await;
    assert_eq!(reply, "Authenticated", "login as {}", name);
    ws
}

/// Sends credentials and returns the relay's reply.
pub async fn login(ws: &mut Ws, username: &str, password: &str) -> String {
    let auth = json!({ "username": username, "password": password });
    send_text(ws, &auth.to_string()).await;
    recv_text(ws).await
}

pub async fn send_text(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string())).await.unwrap();
}

/// Sends a chat envelope.
#[allow(dead_code)]
pub async fn send_chat(ws: &mut Ws, to: &str, ciphertext: &str) {
    let chat = json!({ "to": to, "ciphertext": ciphertext });
    send_text(ws, &chat.to_string()).await;
}

/// Receives the next text frame, panicking after 3 seconds.
pub async fn recv_text(ws: &mut Ws) -> String {
    loop {
        let msg = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("Timeout waiting for message")
            .expect("Stream ended")
            .expect("WebSocket error");
        match msg {
            Message::Text(text) => return text,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected Text message, got {:?}", other),
        }
    }
}

/// Tries to receive a text frame with a short timeout.
#[allow(dead_code)]
pub async fn try_recv_text(ws: &mut Ws) -> Option<String> {
    match timeout(Duration::from_millis(200), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Some(text),
        _ => None,
    }
}

/// Asserts that the relay closes the connection without sending more text.
#[allow(dead_code)]
pub async fn expect_closed(ws: &mut Ws) {
    match timeout(Duration::from_secs(3), ws.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) => {}
        Ok(Some(Ok(other))) => panic!("Expected close, got {:?}", other),
        Err(_) => panic!("Connection was not closed"),
    }
}

/// Polls `check` until it holds, for up to 3 seconds.
#[allow(dead_code)]
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..150 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
