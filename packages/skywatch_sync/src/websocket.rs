//! WebSocket transport speaking the Phoenix v2 frame protocol.
//!
//! One writer task drains an mpsc queue into the socket, one reader task
//! resolves `phx_reply` frames against pending refs and broadcasts everything
//! else, and a heartbeat task keeps idle connections alive.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{sink::SinkExt, stream::StreamExt};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{InboundMessage, JoinOutcome, Transport, TransportEvent};
use crate::wire::{
    EVENT_HEARTBEAT, EVENT_JOIN, EVENT_LEAVE, Frame, HEARTBEAT_TOPIC, PROTOCOL_VERSION, Reply,
};

pub struct WebSocketTransport {
    socket_url: String,
    heartbeat_interval: Duration,
    state: Arc<SocketState>,
}

struct SocketState {
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    /// Pushes awaiting a `phx_reply`, keyed by ref.
    pending: Mutex<HashMap<String, oneshot::Sender<Reply>>>,
    /// Join ref of every topic joined on the current socket.
    join_refs: Mutex<HashMap<String, String>>,
    next_ref: AtomicU64,
    open: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    events: broadcast::Sender<TransportEvent>,
}

impl SocketState {
    fn next_ref(&self) -> String {
        self.next_ref.fetch_add(1, Ordering::Relaxed).to_string()
    }

    fn send(&self, frame: Frame) -> SyncResult<()> {
        match self.outbound.lock().as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| SyncError::Transport("socket closed".to_string())),
            None => Err(SyncError::Transport("socket is not open".to_string())),
        }
    }

    /// Tear down the current socket and tell observers why. Only the first
    /// call per socket emits an event.
    fn shutdown(&self, event: TransportEvent) {
        if !self.open.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.outbound.lock().take();
        self.pending.lock().clear();
        self.join_refs.lock().clear();
        let _ = self.events.send(event);
    }

    fn handle_text(&self, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping undecodable frame");
                return;
            }
        };

        if frame.is_reply() {
            let waiter = frame
                .reference
                .as_ref()
                .and_then(|reference| self.pending.lock().remove(reference));
            match waiter {
                Some(tx) => match serde_json::from_value::<Reply>(frame.payload) {
                    Ok(reply) => {
                        let _ = tx.send(reply);
                    }
                    Err(e) => warn!(topic = %frame.topic, error = %e, "malformed reply"),
                },
                None => trace!(topic = %frame.topic, "reply without waiter"),
            }
            return;
        }

        let _ = self.events.send(TransportEvent::Message(InboundMessage {
            topic: frame.topic,
            event: frame.event,
            payload: frame.payload,
        }));
    }
}

impl WebSocketTransport {
    pub fn new(socket_url: impl Into<String>, heartbeat_interval: Duration, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity);
        Self {
            socket_url: socket_url.into(),
            heartbeat_interval,
            state: Arc::new(SocketState {
                outbound: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                join_refs: Mutex::new(HashMap::new()),
                next_ref: AtomicU64::new(1),
                open: AtomicBool::new(false),
                cancel: Mutex::new(None),
                events,
            }),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.socket_url.clone(),
            config.heartbeat_interval,
            config.event_capacity,
        )
    }

    fn spawn_heartbeat(&self, cancel: CancellationToken) {
        let state = self.state.clone();
        let period = self.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let frame = Frame {
                            join_ref: None,
                            reference: Some(state.next_ref()),
                            topic: HEARTBEAT_TOPIC.to_string(),
                            event: EVENT_HEARTBEAT.to_string(),
                            payload: json!({}),
                        };
                        if state.send(frame).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        if let Some(cancel) = self.state.cancel.lock().take() {
            cancel.cancel();
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, token: &str) -> SyncResult<()> {
        let url = reqwest::Url::parse_with_params(
            &self.socket_url,
            &[("token", token), ("vsn", PROTOCOL_VERSION)],
        )
        .map_err(|e| SyncError::Transport(format!("invalid socket url: {e}")))?;

        // A reopen replaces whatever socket was there before.
        self.state.shutdown(TransportEvent::Closed);

        let (ws_stream, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("websocket connect failed: {e}")))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
        let cancel = CancellationToken::new();
        *self.state.outbound.lock() = Some(tx);
        *self.state.cancel.lock() = Some(cancel.clone());
        self.state.open.store(true, Ordering::SeqCst);

        let writer_state = self.state.clone();
        let writer_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_cancel.cancelled() => {
                        let _ = sink.send(tungstenite::Message::Close(None)).await;
                        break;
                    }
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        let text = match frame.encode() {
                            Ok(text) => text,
                            Err(e) => {
                                warn!(topic = %frame.topic, error = %e, "failed to encode frame");
                                continue;
                            }
                        };
                        if let Err(e) = sink.send(tungstenite::Message::Text(text.into())).await {
                            writer_state.shutdown(TransportEvent::Error(format!("websocket write failed: {e}")));
                            break;
                        }
                    }
                }
            }
        });

        let reader_state = self.state.clone();
        let reader_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = reader_cancel.cancelled() => break,
                    msg = stream.next() => match msg {
                        Some(Ok(tungstenite::Message::Text(text))) => {
                            reader_state.handle_text(text.as_str());
                        }
                        Some(Ok(tungstenite::Message::Close(_))) | None => {
                            info!("websocket closed by server");
                            reader_state.shutdown(TransportEvent::Closed);
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "websocket read failed");
                            reader_state.shutdown(TransportEvent::Error(e.to_string()));
                            break;
                        }
                    }
                }
            }
        });

        self.spawn_heartbeat(cancel);
        debug!(url = %self.socket_url, "websocket open");
        Ok(())
    }

    async fn join(&self, topic: &str, token: &str, timeout: Duration) -> SyncResult<JoinOutcome> {
        let reference = self.state.next_ref();
        let (tx, rx) = oneshot::channel();
        self.state.pending.lock().insert(reference.clone(), tx);
        self.state
            .join_refs
            .lock()
            .insert(topic.to_string(), reference.clone());

        let frame = Frame {
            join_ref: Some(reference.clone()),
            reference: Some(reference.clone()),
            topic: topic.to_string(),
            event: EVENT_JOIN.to_string(),
            payload: json!({ "token": token }),
        };
        if let Err(e) = self.state.send(frame) {
            self.state.pending.lock().remove(&reference);
            self.state.join_refs.lock().remove(topic);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) if reply.is_ok() => Ok(JoinOutcome::Joined),
            Ok(Ok(reply)) => {
                self.state.join_refs.lock().remove(topic);
                Ok(JoinOutcome::Rejected(reply.reason()))
            }
            Ok(Err(_)) => Err(SyncError::Transport(format!(
                "socket closed while joining {topic}"
            ))),
            Err(_) => {
                self.state.pending.lock().remove(&reference);
                self.state.join_refs.lock().remove(topic);
                Ok(JoinOutcome::TimedOut)
            }
        }
    }

    async fn leave(&self, topic: &str) -> SyncResult<()> {
        let join_ref = self.state.join_refs.lock().remove(topic);
        self.state.send(Frame {
            join_ref,
            reference: Some(self.state.next_ref()),
            topic: topic.to_string(),
            event: EVENT_LEAVE.to_string(),
            payload: json!({}),
        })
    }

    fn push(&self, topic: &str, event: &str, payload: Value) -> SyncResult<()> {
        let join_ref = self.state.join_refs.lock().get(topic).cloned();
        self.state.send(Frame {
            join_ref,
            reference: Some(self.state.next_ref()),
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        })
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.state.events.subscribe()
    }

    async fn close(&self) {
        self.state.shutdown(TransportEvent::Closed);
    }

    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }
}
