//! The physical pub/sub transport shared by every plugin.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error::SyncResult;

/// A message delivered by the backend on a joined topic.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub event: String,
    pub payload: Value,
}

/// Events emitted by a transport to its observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(InboundMessage),
    /// The connection failed; state tied to it must be discarded.
    Error(String),
    Closed,
}

/// Outcome of a join handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined,
    Rejected(String),
    TimedOut,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection using a system token. Resolves once the
    /// transport reports it is open.
    async fn open(&self, token: &str) -> SyncResult<()>;

    /// Perform the join handshake for `topic`.
    async fn join(&self, topic: &str, token: &str, timeout: Duration) -> SyncResult<JoinOutcome>;

    async fn leave(&self, topic: &str) -> SyncResult<()>;

    /// Send `payload` tagged with `event` on a joined topic.
    fn push(&self, topic: &str, event: &str, payload: Value) -> SyncResult<()>;

    fn events(&self) -> broadcast::Receiver<TransportEvent>;

    async fn close(&self);

    fn is_open(&self) -> bool;
}
