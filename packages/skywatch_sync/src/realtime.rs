//! Topic-level facade over the shared connection.
//!
//! Plugins talk to the backend only through [`Realtime`]: `subscribe`,
//! `publish` and `request` take `<channel>:<event>` topics and join the
//! underlying channel on first use.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::{Channel, EventHandler};
use crate::config::SyncConfig;
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::error::SyncResult;
use crate::multiplexer::ChannelMultiplexer;
use crate::rpc;
use crate::subscription::Subscription;
use crate::token::{HttpTokenSource, TokenSource};
use crate::topic::Topic;
use crate::transport::Transport;
use crate::websocket::WebSocketTransport;

pub struct Realtime {
    connection: Arc<ConnectionManager>,
    channels: ChannelMultiplexer,
    request_timeout: Duration,
    retry_backoff: Duration,
    retry_backoff_max: Duration,
}

impl Realtime {
    pub fn new(
        transport: Arc<dyn Transport>,
        tokens: Arc<dyn TokenSource>,
        config: &SyncConfig,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(transport, tokens.clone()));
        let channels = ChannelMultiplexer::new(connection.clone(), tokens, config.join_timeout);
        Self {
            connection,
            channels,
            request_timeout: config.request_timeout,
            retry_backoff: config.retry_backoff,
            retry_backoff_max: config.retry_backoff_max.max(config.retry_backoff),
        }
    }

    /// WebSocket transport and HTTP token source, both pointed at the
    /// configured backend.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Arc::new(WebSocketTransport::from_config(config)),
            Arc::new(HttpTokenSource::new(&config.base_url)),
            config,
        )
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn channels(&self) -> &ChannelMultiplexer {
        &self.channels
    }

    pub async fn connect(&self) -> SyncResult<()> {
        self.connection.connect().await
    }

    pub async fn ensure_connected(&self) -> SyncResult<String> {
        self.connection.ensure_connected().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Physical channel for a channel topic such as `entities`.
    pub async fn get_channel(&self, channel_topic: &str) -> SyncResult<Arc<Channel>> {
        self.channels.get_channel(channel_topic).await
    }

    /// Attach `handler` to the event named by `topic`.
    pub async fn subscribe<F>(&self, topic: &str, handler: F) -> SyncResult<Subscription>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = Topic::parse(topic)?;
        let channel = self.channels.get_channel(topic.channel()).await?;
        debug!(topic = %topic, "subscribed");
        Ok(channel.on(topic.event(), handler))
    }

    /// Keep `handler` attached to `topic` for as long as the returned task
    /// runs.
    ///
    /// Failed joins are retried with a doubling delay. When the channel is
    /// closed (transport loss, server close) the task joins again and
    /// re-attaches the handler. Aborting the task detaches it.
    pub fn spawn_subscription<F>(self: &Arc<Self>, topic: &str, handler: F) -> SyncResult<JoinHandle<()>>
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let topic = Topic::parse(topic)?.to_string();
        let handler: EventHandler = Arc::new(handler);
        let realtime = self.clone();

        Ok(tokio::spawn(async move {
            let mut backoff = realtime.retry_backoff;
            loop {
                let attached = handler.clone();
                match realtime.subscribe(&topic, move |payload| attached(payload)).await {
                    Ok(subscription) => {
                        backoff = realtime.retry_backoff;
                        subscription.closed().await;
                        info!(topic = %topic, "channel closed, subscribing again");
                    }
                    Err(e) => {
                        warn!(
                            topic = %topic,
                            error = %e,
                            retry_in_ms = backoff.as_millis() as u64,
                            "subscribe failed"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(realtime.retry_backoff_max);
                    }
                }
            }
        }))
    }

    pub async fn publish(&self, topic: &str, payload: Value) -> SyncResult<()> {
        let topic = Topic::parse(topic)?;
        let channel = self.channels.get_channel(topic.channel()).await?;
        channel.push(topic.event(), payload)
    }

    /// Send a request on `topic` and wait up to `timeout` for the response
    /// published on `<event>_result`.
    pub async fn request(&self, topic: &str, payload: Value, timeout: Duration) -> SyncResult<Value> {
        let topic = Topic::parse(topic)?;
        let channel = self.channels.get_channel(topic.channel()).await?;
        rpc::request(&channel, &topic, payload, timeout).await
    }

    pub async fn request_default(&self, topic: &str, payload: Value) -> SyncResult<Value> {
        self.request(topic, payload, self.request_timeout).await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }
}
