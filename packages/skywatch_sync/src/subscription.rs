use std::fmt;
use std::sync::Arc;

use crate::channel::Channel;

/// Revocable handle for one event handler on a channel.
///
/// Dropping the handle detaches the handler.
pub struct Subscription {
    channel: Arc<Channel>,
    event: String,
    id: u64,
    active: bool,
}

impl Subscription {
    pub(crate) fn new(channel: Arc<Channel>, event: String, id: u64) -> Self {
        Self {
            channel,
            event,
            id,
            active: true,
        }
    }

    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Resolves once the underlying channel is closed. The handler will not
    /// fire again after that.
    pub async fn closed(&self) {
        self.channel.closed().await;
    }

    pub fn unsubscribe(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if std::mem::take(&mut self.active) {
            self.channel.detach(&self.event, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.channel.topic())
            .field("event", &self.event)
            .field("id", &self.id)
            .finish()
    }
}
