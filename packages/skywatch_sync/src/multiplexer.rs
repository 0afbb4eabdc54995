//! Maps logical topics onto one joined physical channel each.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, trace, warn};

use crate::channel::{Channel, ChannelState};
use crate::connection::ConnectionManager;
use crate::error::{SyncError, SyncResult};
use crate::token::{TokenRequest, TokenSource};
use crate::transport::{InboundMessage, JoinOutcome, TransportEvent};
use crate::wire::{EVENT_CLOSE, EVENT_ERROR};

type JoinFuture = Shared<BoxFuture<'static, SyncResult<Arc<Channel>>>>;

#[derive(Default)]
struct Registry {
    /// At most one pending join per topic.
    joining: HashMap<String, JoinFuture>,
    joined: HashMap<String, Arc<Channel>>,
    /// Channels that receive inbound messages, joined or still joining.
    routes: HashMap<String, Arc<Channel>>,
    routing: bool,
}

impl Registry {
    fn purge(&mut self, topic: &str) -> Option<Arc<Channel>> {
        let routed = self.routes.remove(topic);
        let joined = self.joined.remove(topic);
        let channel = joined.or(routed);
        if let Some(channel) = &channel {
            channel.set_state(ChannelState::Closed);
        }
        channel
    }
}

pub struct ChannelMultiplexer {
    connection: Arc<ConnectionManager>,
    tokens: Arc<dyn TokenSource>,
    join_timeout: Duration,
    registry: Arc<Mutex<Registry>>,
}

impl ChannelMultiplexer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        tokens: Arc<dyn TokenSource>,
        join_timeout: Duration,
    ) -> Self {
        Self {
            connection,
            tokens,
            join_timeout,
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// Return the joined channel for `topic`, joining it if needed.
    ///
    /// Concurrent callers share a single join handshake and receive the same
    /// channel, or the same error.
    pub async fn get_channel(&self, topic: &str) -> SyncResult<Arc<Channel>> {
        let pending = {
            let mut registry = self.registry.lock();
            if let Some(pending) = registry.joining.get(topic) {
                pending.clone()
            } else if let Some(channel) = registry.joined.get(topic) {
                return Ok(channel.clone());
            } else {
                if !std::mem::replace(&mut registry.routing, true) {
                    spawn_router(self.registry.clone(), self.connection.transport().events());
                }
                let pending = self.spawn_join(topic.to_string());
                registry.joining.insert(topic.to_string(), pending.clone());
                pending
            }
        };
        pending.await
    }

    /// Leave `topic` and forget its channel.
    pub async fn leave(&self, topic: &str) -> SyncResult<()> {
        let channel = self.registry.lock().purge(topic);
        if channel.is_none() {
            return Ok(());
        }
        info!(topic, "leaving channel");
        self.connection.transport().leave(topic).await
    }

    pub fn joined_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.registry.lock().joined.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub fn pending_joins(&self) -> usize {
        self.registry.lock().joining.len()
    }

    fn spawn_join(&self, topic: String) -> JoinFuture {
        let connection = self.connection.clone();
        let tokens = self.tokens.clone();
        let registry = self.registry.clone();
        let timeout = self.join_timeout;

        let handle = tokio::spawn(async move {
            let channel = Arc::new(Channel::new(topic.clone(), connection.transport().clone()));
            let result = join(&connection, tokens.as_ref(), &registry, &channel, timeout).await;

            let mut registry = registry.lock();
            registry.joining.remove(&topic);
            // A transport loss between the join reply and this point has
            // already dropped the route; the socket this join belongs to is gone.
            let result = result.and_then(|()| {
                let routed = registry
                    .routes
                    .get(&topic)
                    .is_some_and(|routed| Arc::ptr_eq(routed, &channel));
                if routed {
                    Ok(())
                } else {
                    Err(SyncError::Transport(format!(
                        "connection lost while joining {topic}"
                    )))
                }
            });
            match result {
                Ok(()) => {
                    channel.set_state(ChannelState::Joined);
                    registry.joined.insert(topic.clone(), channel.clone());
                    info!(topic = %topic, channels = registry.joined.len(), "channel joined");
                    Ok(channel)
                }
                Err(e) => {
                    registry.purge(&topic);
                    channel.set_state(ChannelState::Closed);
                    warn!(topic = %topic, error = %e, "channel join failed");
                    Err(e)
                }
            }
        });

        async move { handle.await.unwrap_or_else(|e| Err(SyncError::from(e))) }
            .boxed()
            .shared()
    }
}

async fn join(
    connection: &ConnectionManager,
    tokens: &dyn TokenSource,
    registry: &Mutex<Registry>,
    channel: &Arc<Channel>,
    timeout: Duration,
) -> SyncResult<()> {
    let topic = channel.topic();
    let connection_id = connection.ensure_connected().await?;
    let grant = tokens
        .issue(TokenRequest::new(topic, Some(connection_id)))
        .await?;

    registry
        .lock()
        .routes
        .insert(topic.to_string(), channel.clone());
    debug!(topic, "sending join");

    match connection
        .transport()
        .join(topic, &grant.token, timeout)
        .await?
    {
        JoinOutcome::Joined => Ok(()),
        JoinOutcome::Rejected(reason) => Err(SyncError::JoinRejected {
            topic: topic.to_string(),
            reason,
        }),
        JoinOutcome::TimedOut => Err(SyncError::JoinTimeout {
            topic: topic.to_string(),
        }),
    }
}

fn spawn_router(registry: Arc<Mutex<Registry>>, mut events: broadcast::Receiver<TransportEvent>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Message(message)) => route(&registry, message),
                Ok(TransportEvent::Error(_)) | Ok(TransportEvent::Closed) => {
                    let closed = close_all(&registry);
                    if closed > 0 {
                        info!(channels = closed, "transport down, channels closed");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "channel router lagged, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        registry.lock().routing = false;
    });
}

fn route(registry: &Mutex<Registry>, message: InboundMessage) {
    if message.event == EVENT_ERROR || message.event == EVENT_CLOSE {
        if registry.lock().purge(&message.topic).is_some() {
            warn!(topic = %message.topic, event = %message.event, "channel closed by server");
        }
        return;
    }

    let channel = registry.lock().routes.get(&message.topic).cloned();
    match channel {
        Some(channel) => {
            let delivered = channel.dispatch(&message.event, &message.payload);
            trace!(topic = %message.topic, event = %message.event, delivered, "routed");
        }
        None => trace!(topic = %message.topic, "message for unknown channel"),
    }
}

fn close_all(registry: &Mutex<Registry>) -> usize {
    let channels: Vec<Arc<Channel>> = {
        let mut registry = registry.lock();
        registry.joined.clear();
        registry.routes.drain().map(|(_, channel)| channel).collect()
    };
    for channel in &channels {
        channel.set_state(ChannelState::Closed);
    }
    channels.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{FakeTokenSource, FakeTransport};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        multiplexer: Arc<ChannelMultiplexer>,
        transport: Arc<FakeTransport>,
        tokens: Arc<FakeTokenSource>,
    }

    fn harness() -> Harness {
        let transport = Arc::new(FakeTransport::new());
        let tokens = Arc::new(FakeTokenSource::new());
        let connection = Arc::new(ConnectionManager::new(transport.clone(), tokens.clone()));
        let multiplexer = Arc::new(ChannelMultiplexer::new(
            connection,
            tokens.clone(),
            Duration::from_secs(10),
        ));
        Harness {
            multiplexer,
            transport,
            tokens,
        }
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_gets_join_once() {
        let h = harness();

        let results = futures::future::join_all(
            (0..8).map(|_| h.multiplexer.get_channel("entities")),
        )
        .await;

        let channels: Vec<Arc<Channel>> = results.into_iter().map(|r| r.unwrap()).collect();
        assert_eq!(h.transport.join_count("entities"), 1);
        assert_eq!(h.tokens.requests_for("entities"), 1);
        assert!(channels.iter().all(|c| Arc::ptr_eq(c, &channels[0])));
        assert!(channels[0].is_joined());
        assert_eq!(h.multiplexer.pending_joins(), 0);
    }

    #[tokio::test]
    async fn topic_token_carries_connection_id() {
        let h = harness();
        h.multiplexer.get_channel("entities").await.unwrap();

        let requests = h.tokens.requests_of("entities");
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id.as_deref(), Some("conn-1"));
    }

    #[tokio::test]
    async fn joined_channel_is_reused() {
        let h = harness();
        let first = h.multiplexer.get_channel("entities").await.unwrap();
        let second = h.multiplexer.get_channel("entities").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(h.transport.join_count("entities"), 1);
    }

    #[tokio::test]
    async fn rejection_fails_every_waiter_and_purges() {
        let h = harness();
        h.transport
            .script_join("entities", JoinOutcome::Rejected("unauthorized".into()));

        let results = futures::future::join_all(
            (0..3).map(|_| h.multiplexer.get_channel("entities")),
        )
        .await;

        for result in results {
            assert_eq!(
                result.unwrap_err(),
                SyncError::JoinRejected {
                    topic: "entities".into(),
                    reason: "unauthorized".into()
                }
            );
        }
        assert!(h.multiplexer.joined_topics().is_empty());
        assert_eq!(h.multiplexer.pending_joins(), 0);

        // The next call starts a fresh join.
        let channel = h.multiplexer.get_channel("entities").await.unwrap();
        assert!(channel.is_joined());
        assert_eq!(h.transport.join_count("entities"), 2);
    }

    #[tokio::test]
    async fn join_timeout_is_reported() {
        let h = harness();
        h.transport.script_join("entities", JoinOutcome::TimedOut);
        let err = h.multiplexer.get_channel("entities").await.unwrap_err();
        assert_eq!(err.error_code(), "join_timeout");
    }

    #[tokio::test]
    async fn connect_failure_propagates_to_join() {
        let h = harness();
        h.tokens.fail_next("system", 1);
        let err = h.multiplexer.get_channel("entities").await.unwrap_err();
        assert_eq!(err.error_code(), "token_fetch");
        assert_eq!(h.transport.join_count("entities"), 0);
        assert_eq!(h.multiplexer.pending_joins(), 0);
    }

    #[tokio::test]
    async fn inbound_messages_reach_handlers() {
        let h = harness();
        let channel = h.multiplexer.get_channel("entities").await.unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let _sub = channel.on("aircraft", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        h.transport.deliver("entities", "aircraft", json!({"entities": []}));
        h.transport.deliver("entities", "vessels", json!({"entities": []}));
        h.transport.deliver("other", "aircraft", json!({}));
        settle().await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transport_error_closes_channels() {
        let h = harness();
        let channel = h.multiplexer.get_channel("entities").await.unwrap();

        h.transport.emit(TransportEvent::Error("reset".into()));
        settle().await;

        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(h.multiplexer.joined_topics().is_empty());

        let rejoined = h.multiplexer.get_channel("entities").await.unwrap();
        assert!(!Arc::ptr_eq(&channel, &rejoined));
        assert_eq!(h.tokens.requests_for("system"), 2);
    }

    #[tokio::test]
    async fn server_close_purges_one_channel() {
        let h = harness();
        let entities = h.multiplexer.get_channel("entities").await.unwrap();
        let alerts = h.multiplexer.get_channel("alerts").await.unwrap();

        h.transport.deliver("entities", EVENT_CLOSE, json!({}));
        settle().await;

        assert_eq!(entities.state(), ChannelState::Closed);
        assert!(alerts.is_joined());
        assert_eq!(h.multiplexer.joined_topics(), vec!["alerts".to_string()]);
    }

    #[tokio::test]
    async fn leave_sends_leave_and_purges() {
        let h = harness();
        let channel = h.multiplexer.get_channel("entities").await.unwrap();

        h.multiplexer.leave("entities").await.unwrap();
        assert_eq!(channel.state(), ChannelState::Closed);
        assert_eq!(h.transport.leaves(), vec!["entities".to_string()]);

        // Leaving an unknown topic is a no-op.
        h.multiplexer.leave("entities").await.unwrap();
        assert_eq!(h.transport.leaves().len(), 1);
    }

    #[tokio::test]
    async fn connection_lost_after_join_reply_is_not_joined() {
        let h = harness();
        h.transport.drop_after_join("entities");

        let err = h.multiplexer.get_channel("entities").await.unwrap_err();
        assert_eq!(err.error_code(), "transport");
        assert!(h.multiplexer.joined_topics().is_empty());
        assert_eq!(h.multiplexer.pending_joins(), 0);

        // The next call reconnects and joins on the new socket.
        let channel = h.multiplexer.get_channel("entities").await.unwrap();
        assert!(channel.is_joined());
        assert_eq!(h.tokens.requests_for("system"), 2);
        assert_eq!(h.multiplexer.joined_topics(), vec!["entities".to_string()]);
    }
}
