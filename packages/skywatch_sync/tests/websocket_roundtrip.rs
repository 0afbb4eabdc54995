//! Drives the WebSocket transport and HTTP token source against an
//! in-process Phoenix-style backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{
        Query, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::{Value, json};
use skywatch_sync::wire::{EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, EVENT_REPLY, Frame};
use skywatch_sync::{
    ConnectionStatus, HttpTokenSource, Realtime, SyncConfig, SyncError, TokenGrant, TokenRequest,
    TokenSource, Transport, TransportEvent, WebSocketTransport,
};
use tokio::sync::mpsc;

const SYSTEM_TOKEN: &str = "system-secret";

async fn issue_token(Json(request): Json<TokenRequest>) -> Json<TokenGrant> {
    if request.channel == "system" {
        return Json(TokenGrant {
            id: "conn-1".to_string(),
            token: SYSTEM_TOKEN.to_string(),
        });
    }
    Json(TokenGrant {
        id: request.id.unwrap_or_default(),
        token: format!("{}-token", request.channel),
    })
}

async fn upgrade(ws: WebSocketUpgrade, Query(params): Query<HashMap<String, String>>) -> Response {
    let authorized = params.get("token").map(String::as_str) == Some(SYSTEM_TOKEN)
        && params.get("vsn").map(String::as_str) == Some("2.0.0");
    if !authorized {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(serve_socket)
}

fn reply(to: &Frame, status: &str, response: Value) -> Frame {
    Frame {
        join_ref: to.join_ref.clone(),
        reference: to.reference.clone(),
        topic: to.topic.clone(),
        event: EVENT_REPLY.to_string(),
        payload: json!({ "status": status, "response": response }),
    }
}

fn broadcast(topic: &str, event: &str, payload: Value) -> Frame {
    Frame {
        join_ref: None,
        reference: None,
        topic: topic.to_string(),
        event: event.to_string(),
        payload,
    }
}

/// Frames sent back for `frame`, or `None` to drop the connection.
fn respond(frame: &Frame) -> Option<Vec<Frame>> {
    let frames = match frame.event.as_str() {
        EVENT_HEARTBEAT | EVENT_LEAVE => vec![reply(frame, "ok", json!({}))],
        EVENT_JOIN => {
            let expected = format!("{}-token", frame.topic);
            if frame.topic == "forbidden" {
                vec![reply(frame, "error", json!({"reason": "unauthorized"}))]
            } else if frame.payload["token"] != expected.as_str() {
                vec![reply(frame, "error", json!({"reason": "bad token"}))]
            } else {
                vec![reply(frame, "ok", json!({}))]
            }
        }
        "lookup" => vec![broadcast(
            &frame.topic,
            "lookup_result",
            json!({
                "request_id": frame.payload["request_id"],
                "data": {"id": frame.payload["id"]}
            }),
        )],
        "announce" => vec![broadcast(&frame.topic, "announced", frame.payload.clone())],
        "kick" => return None,
        _ => Vec::new(),
    };
    Some(frames)
}

async fn serve_socket(mut socket: WebSocket) {
    while let Some(Ok(message)) = socket.recv().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(frame) = Frame::decode(text.as_str()) else {
            continue;
        };
        let Some(frames) = respond(&frame) else {
            let _ = socket.send(Message::Close(None)).await;
            return;
        };
        for out in frames {
            let encoded = out.encode().expect("encode frame");
            if socket.send(Message::Text(encoded.into())).await.is_err() {
                return;
            }
        }
    }
}

struct Backend {
    base_url: String,
    socket_url: String,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

async fn spawn_backend() -> Backend {
    let app = Router::new()
        .route("/api/token", post(issue_token))
        .route("/socket/websocket", get(upgrade));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });
    Backend {
        base_url: format!("http://127.0.0.1:{port}/api"),
        socket_url: format!("ws://127.0.0.1:{port}/socket/websocket"),
        _shutdown: tx,
    }
}

fn config(backend: &Backend) -> SyncConfig {
    SyncConfig {
        base_url: backend.base_url.clone(),
        socket_url: backend.socket_url.clone(),
        join_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(50),
        ..SyncConfig::default()
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("skywatch_sync=debug")
        .with_test_writer()
        .try_init();
}

#[tokio::test]
async fn token_source_posts_to_endpoint() {
    let backend = spawn_backend().await;
    let tokens = HttpTokenSource::new(&backend.base_url);

    let grant = tokens
        .issue(TokenRequest::new("entities", Some("conn-1".into())))
        .await
        .unwrap();
    assert_eq!(grant.id, "conn-1");
    assert_eq!(grant.token, "entities-token");
}

#[tokio::test]
async fn token_endpoint_errors_are_reported() {
    let backend = spawn_backend().await;
    let tokens = HttpTokenSource::new(&format!("{}/missing", backend.base_url));

    let err = tokens
        .issue(TokenRequest::new("system", None))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::TokenFetch { ref channel, .. } if channel == "system"));
}

#[tokio::test]
async fn subscribe_publish_and_request_over_websocket() {
    init_tracing();
    let backend = spawn_backend().await;
    let realtime = Realtime::from_config(&config(&backend));

    assert_eq!(realtime.ensure_connected().await.unwrap(), "conn-1");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _sub = realtime
        .subscribe("registry:announced", move |payload| {
            let _ = tx.send(payload.clone());
        })
        .await
        .unwrap();

    realtime
        .publish("registry:announce", json!({"hello": "world"}))
        .await
        .unwrap();
    let echoed = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(echoed, json!({"hello": "world"}));

    let (a, b) = tokio::join!(
        realtime.request_default("registry:lookup", json!({"id": "AAAA11"})),
        realtime.request_default("registry:lookup", json!({"id": "BBBB22"})),
    );
    assert_eq!(a.unwrap(), json!({"id": "AAAA11"}));
    assert_eq!(b.unwrap(), json!({"id": "BBBB22"}));

    // Heartbeats are answered and must not disturb anything.
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(realtime.channels().joined_topics(), vec!["registry".to_string()]);

    realtime.channels().leave("registry").await.unwrap();
    assert!(realtime.channels().joined_topics().is_empty());
    realtime.disconnect().await;
    assert_eq!(realtime.status(), ConnectionStatus::Disconnected);
}

#[tokio::test]
async fn rejected_join_reaches_every_waiter() {
    let backend = spawn_backend().await;
    let realtime = Arc::new(Realtime::from_config(&config(&backend)));

    let (a, b) = tokio::join!(
        realtime.get_channel("forbidden"),
        realtime.get_channel("forbidden")
    );
    for result in [a, b] {
        assert_eq!(
            result.unwrap_err(),
            SyncError::JoinRejected {
                topic: "forbidden".into(),
                reason: "unauthorized".into()
            }
        );
    }
    assert_eq!(realtime.channels().pending_joins(), 0);
}

#[tokio::test]
async fn server_close_is_observed() {
    let backend = spawn_backend().await;
    let transport = Arc::new(WebSocketTransport::new(
        backend.socket_url.clone(),
        Duration::from_secs(30),
        64,
    ));
    let tokens = Arc::new(HttpTokenSource::new(&backend.base_url));
    let realtime = Realtime::new(transport.clone(), tokens, &config(&backend));

    let channel = realtime.get_channel("session").await.unwrap();
    let mut events = transport.events();
    channel.push("kick", json!({})).unwrap();

    let closed = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Closed) | Ok(TransportEvent::Error(_)) => return true,
                Ok(_) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap();
    assert!(closed);
    assert!(!transport.is_open());

    for _ in 0..100 {
        if !channel.is_joined() && realtime.status() == ConnectionStatus::Disconnected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!channel.is_joined());

    // The next call reconnects and rejoins.
    let rejoined = realtime.get_channel("session").await.unwrap();
    assert!(rejoined.is_joined());
}

#[tokio::test]
async fn socket_rejects_bad_token() {
    let backend = spawn_backend().await;
    let transport = WebSocketTransport::new(backend.socket_url.clone(), Duration::from_secs(30), 16);
    let err = transport.open("wrong").await.unwrap_err();
    assert_eq!(err.error_code(), "transport");
    assert!(!transport.is_open());
}
