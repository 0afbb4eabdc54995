//! A joined physical channel and its per-event handler registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tracing::trace;

use crate::error::{SyncError, SyncResult};
use crate::subscription::Subscription;
use crate::transport::Transport;

pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Joining,
    Joined,
    Closed,
}

pub struct Channel {
    topic: String,
    state: watch::Sender<ChannelState>,
    handlers: Mutex<HashMap<String, Vec<(u64, EventHandler)>>>,
    next_handler: AtomicU64,
    transport: Arc<dyn Transport>,
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    pub(crate) fn new(topic: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self {
            topic: topic.into(),
            state: watch::Sender::new(ChannelState::Joining),
            handlers: Mutex::new(HashMap::new()),
            next_handler: AtomicU64::new(1),
            transport,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    pub(crate) fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    /// Resolves once the channel is closed, immediately if it already is.
    ///
    /// A closed channel is never reopened: handlers attached to it stay
    /// silent and the owner has to subscribe again.
    pub async fn closed(&self) {
        let mut state = self.state.subscribe();
        let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
    }

    /// Attach `handler` for `event`. The returned subscription detaches only
    /// this handler; the channel stays joined for everyone else.
    pub fn on<F>(self: &Arc<Self>, event: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        trace!(topic = %self.topic, event, handler = id, "handler attached");
        Subscription::new(self.clone(), event.to_string(), id)
    }

    /// Send `payload` tagged with `event`.
    pub fn push(&self, event: &str, payload: Value) -> SyncResult<()> {
        if self.state() != ChannelState::Joined {
            return Err(SyncError::ChannelClosed(self.topic.clone()));
        }
        self.transport.push(&self.topic, event, payload)
    }

    pub fn handler_count(&self, event: &str) -> usize {
        self.handlers.lock().get(event).map_or(0, Vec::len)
    }

    pub(crate) fn detach(&self, event: &str, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(event);
        }
        removed
    }

    /// Run every handler registered for `event`. Returns how many ran.
    pub(crate) fn dispatch(&self, event: &str, payload: &Value) -> usize {
        // Handlers may subscribe or unsubscribe, so run them unlocked.
        let handlers: Vec<EventHandler> = self
            .handlers
            .lock()
            .get(event)
            .map(|list| list.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();
        for handler in &handlers {
            handler(payload);
        }
        handlers.len()
    }
}
