//! In-memory fakes for the transport, token endpoint and history backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{Semaphore, broadcast};

use crate::entity::{Entity, EntityKey};
use crate::error::{SyncError, SyncResult};
use crate::history::HistorySource;
use crate::token::{TokenGrant, TokenRequest, TokenSource};
use crate::topic::SYSTEM_CHANNEL;
use crate::trajectory::TrajectoryPoint;
use crate::transport::{InboundMessage, JoinOutcome, Transport, TransportEvent};

type Responder = Box<dyn Fn(&str, &str, &Value) -> Option<(String, Value)> + Send + Sync>;

/// Transport double that records everything and answers joins from a script.
pub struct FakeTransport {
    events: broadcast::Sender<TransportEvent>,
    open: AtomicBool,
    opens: AtomicUsize,
    failing_opens: AtomicUsize,
    joins: Mutex<Vec<String>>,
    join_script: Mutex<HashMap<String, VecDeque<JoinOutcome>>>,
    drop_after_join: Mutex<HashSet<String>>,
    leaves: Mutex<Vec<String>>,
    pushes: Mutex<Vec<(String, String, Value)>>,
    responder: Mutex<Option<Responder>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            open: AtomicBool::new(false),
            opens: AtomicUsize::new(0),
            failing_opens: AtomicUsize::new(0),
            joins: Mutex::new(Vec::new()),
            join_script: Mutex::new(HashMap::new()),
            drop_after_join: Mutex::new(HashSet::new()),
            leaves: Mutex::new(Vec::new()),
            pushes: Mutex::new(Vec::new()),
            responder: Mutex::new(None),
        }
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_open(&self) {
        self.failing_opens.fetch_add(1, Ordering::SeqCst);
    }

    /// Queue the outcome of the next join on `topic`. Unscripted joins succeed.
    pub fn script_join(&self, topic: &str, outcome: JoinOutcome) {
        self.join_script
            .lock()
            .entry(topic.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Acknowledge the next join on `topic`, but lose the socket before the
    /// reply is handed back to the caller.
    pub fn drop_after_join(&self, topic: &str) {
        self.drop_after_join.lock().insert(topic.to_string());
    }

    pub fn join_count(&self, topic: &str) -> usize {
        self.joins.lock().iter().filter(|t| *t == topic).count()
    }

    pub fn leaves(&self) -> Vec<String> {
        self.leaves.lock().clone()
    }

    pub fn pushes(&self) -> Vec<(String, String, Value)> {
        self.pushes.lock().clone()
    }

    /// Answer pushes with `(event, payload)` on the same topic.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &str, &Value) -> Option<(String, Value)> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(responder));
    }

    pub fn emit(&self, event: TransportEvent) {
        if matches!(event, TransportEvent::Error(_) | TransportEvent::Closed) {
            self.open.store(false, Ordering::SeqCst);
        }
        let _ = self.events.send(event);
    }

    pub fn deliver(&self, topic: &str, event: &str, payload: Value) {
        self.emit(TransportEvent::Message(InboundMessage {
            topic: topic.to_string(),
            event: event.to_string(),
            payload,
        }));
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn open(&self, _token: &str) -> SyncResult<()> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        let failing = self
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::Transport("connection refused".into()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn join(&self, topic: &str, _token: &str, _timeout: Duration) -> SyncResult<JoinOutcome> {
        self.joins.lock().push(topic.to_string());
        tokio::task::yield_now().await;
        if !self.is_open() {
            return Err(SyncError::Transport("socket is not open".into()));
        }
        let scripted = self
            .join_script
            .lock()
            .get_mut(topic)
            .and_then(VecDeque::pop_front);
        if self.drop_after_join.lock().remove(topic) {
            self.emit(TransportEvent::Closed);
            for _ in 0..20 {
                tokio::task::yield_now().await;
            }
        }
        Ok(scripted.unwrap_or(JoinOutcome::Joined))
    }

    async fn leave(&self, topic: &str) -> SyncResult<()> {
        self.leaves.lock().push(topic.to_string());
        Ok(())
    }

    fn push(&self, topic: &str, event: &str, payload: Value) -> SyncResult<()> {
        if !self.is_open() {
            return Err(SyncError::Transport("socket is not open".into()));
        }
        self.pushes
            .lock()
            .push((topic.to_string(), event.to_string(), payload.clone()));
        let reply = self
            .responder
            .lock()
            .as_ref()
            .and_then(|respond| respond(topic, event, &payload));
        if let Some((reply_event, reply_payload)) = reply {
            self.deliver(topic, &reply_event, reply_payload);
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    async fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed);
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Token source issuing `conn-N` ids on the system channel.
pub struct FakeTokenSource {
    requests: Mutex<Vec<TokenRequest>>,
    failures: Mutex<HashMap<String, usize>>,
    issued: AtomicUsize,
}

impl FakeTokenSource {
    pub fn new() -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn fail_next(&self, channel: &str, times: usize) {
        *self.failures.lock().entry(channel.to_string()).or_default() += times;
    }

    pub fn requests_of(&self, channel: &str) -> Vec<TokenRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.channel == channel)
            .cloned()
            .collect()
    }

    pub fn requests_for(&self, channel: &str) -> usize {
        self.requests_of(channel).len()
    }
}

#[async_trait]
impl TokenSource for FakeTokenSource {
    async fn issue(&self, request: TokenRequest) -> SyncResult<TokenGrant> {
        self.requests.lock().push(request.clone());

        {
            let mut failures = self.failures.lock();
            if let Some(left) = failures.get_mut(&request.channel).filter(|n| **n > 0) {
                *left -= 1;
                return Err(SyncError::TokenFetch {
                    channel: request.channel,
                    message: "token endpoint unavailable".into(),
                });
            }
        }

        if request.channel == SYSTEM_CHANNEL {
            let n = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
            return Ok(TokenGrant {
                id: format!("conn-{n}"),
                token: format!("system-token-{n}"),
            });
        }
        Ok(TokenGrant {
            id: request.id.unwrap_or_default(),
            token: format!("{}-token", request.channel),
        })
    }
}

/// History backend serving canned points, optionally held behind a gate.
pub struct FakeHistory {
    points: Mutex<HashMap<EntityKey, Vec<TrajectoryPoint>>>,
    calls: Mutex<Vec<EntityKey>>,
    failures: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl FakeHistory {
    pub fn new() -> Self {
        Self {
            points: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            gate: Mutex::new(None),
        }
    }

    pub fn set_points(&self, key: EntityKey, points: Vec<TrajectoryPoint>) {
        self.points.lock().insert(key, points);
    }

    pub fn fail_next(&self, times: usize) {
        self.failures.fetch_add(times, Ordering::SeqCst);
    }

    /// Block fetches until permits are added to the returned semaphore.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock() = Some(gate.clone());
        gate
    }

    pub fn fetch_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl HistorySource for FakeHistory {
    async fn fetch(&self, key: &EntityKey) -> SyncResult<Vec<TrajectoryPoint>> {
        self.calls.lock().push(key.clone());
        let gate = self.gate.lock().clone();
        match gate {
            Some(gate) => {
                let _permit = gate.acquire().await;
            }
            None => tokio::task::yield_now().await,
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SyncError::HistoryFetch {
                key: key.to_string(),
                message: "history backend unavailable".into(),
            });
        }
        Ok(self.points.lock().get(key).cloned().unwrap_or_default())
    }
}

pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0)
        .single()
        .expect("valid base time")
}

/// Point `secs` seconds after `base_time()`.
pub fn point_at(secs: f64) -> TrajectoryPoint {
    let timestamp = base_time() + chrono::Duration::milliseconds((secs * 1000.0).round() as i64);
    TrajectoryPoint {
        timestamp,
        latitude: 52.0 + secs / 1000.0,
        longitude: 4.0 + secs / 1000.0,
        altitude: None,
        heading: None,
        speed: None,
    }
}

/// Entity whose state carries a position reported `secs` after `base_time()`.
pub fn entity_at(id: &str, entity_type: &str, secs: f64) -> Entity {
    let point = point_at(secs);
    Entity::new(
        id,
        entity_type,
        json!({
            "timestamp": point.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            "latitude": point.latitude,
            "longitude": point.longitude,
        }),
    )
}
