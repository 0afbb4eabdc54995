//! ConnectionManager: owns the single physical transport and its connection id.

use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::{SyncError, SyncResult};
use crate::token::{TokenRequest, TokenSource};
use crate::topic::SYSTEM_CHANNEL;
use crate::transport::{Transport, TransportEvent};

type ConnectFuture = Shared<BoxFuture<'static, SyncResult<String>>>;

/// Outstanding or completed connect attempt, tagged so a stale attempt can
/// never clear the state of a newer one.
struct Attempt {
    generation: u64,
    future: ConnectFuture,
}

#[derive(Default)]
struct ConnectionState {
    id: Option<String>,
    /// Last id the backend issued; sent back when reconnecting.
    previous_id: Option<String>,
    attempt: Option<Attempt>,
    generation: u64,
    monitoring: bool,
}

/// Connection lifecycle as seen from outside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected { id: String },
}

pub struct ConnectionManager {
    transport: Arc<dyn Transport>,
    tokens: Arc<dyn TokenSource>,
    state: Arc<Mutex<ConnectionState>>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, tokens: Arc<dyn TokenSource>) -> Self {
        Self {
            transport,
            tokens,
            state: Arc::new(Mutex::new(ConnectionState::default())),
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Connect once. Concurrent and repeated callers share the same attempt
    /// until it fails or the transport reports an error.
    pub async fn connect(&self) -> SyncResult<()> {
        let future = {
            let mut state = self.state.lock();
            match &state.attempt {
                Some(attempt) => attempt.future.clone(),
                None => {
                    state.generation += 1;
                    let generation = state.generation;
                    let future = self.attempt(generation, state.previous_id.clone());
                    state.attempt = Some(Attempt {
                        generation,
                        future: future.clone(),
                    });
                    future
                }
            }
        };
        future.await.map(|_| ())
    }

    /// Connect if needed and return the connection id.
    pub async fn ensure_connected(&self) -> SyncResult<String> {
        self.connect().await?;
        self.state
            .lock()
            .id
            .clone()
            .ok_or(SyncError::MissingConnectionId)
    }

    pub fn connection_id(&self) -> Option<String> {
        self.state.lock().id.clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        let state = self.state.lock();
        match (&state.id, &state.attempt) {
            (Some(id), _) => ConnectionStatus::Connected { id: id.clone() },
            (None, Some(_)) => ConnectionStatus::Connecting,
            (None, None) => ConnectionStatus::Disconnected,
        }
    }

    /// Close the transport and forget the current connection.
    pub async fn disconnect(&self) {
        invalidate(&self.state);
        self.transport.close().await;
        info!("disconnected");
    }

    fn attempt(&self, generation: u64, previous_id: Option<String>) -> ConnectFuture {
        let transport = self.transport.clone();
        let tokens = self.tokens.clone();
        let state = self.state.clone();

        async move {
            // Subscribe before opening so an immediate failure is not missed.
            let events = transport.events();

            let result = async {
                let grant = tokens
                    .issue(TokenRequest::new(SYSTEM_CHANNEL, previous_id))
                    .await?;
                transport.open(&grant.token).await?;
                Ok::<_, SyncError>(grant.id)
            }
            .await;

            match result {
                Ok(id) => {
                    let spawn_monitor = {
                        let mut guard = state.lock();
                        guard.id = Some(id.clone());
                        guard.previous_id = Some(id.clone());
                        !std::mem::replace(&mut guard.monitoring, true)
                    };
                    if spawn_monitor {
                        spawn_monitor_task(state, events);
                    }
                    info!(connection_id = %id, "connected");
                    Ok(id)
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    let mut guard = state.lock();
                    if guard.attempt.as_ref().map(|a| a.generation) == Some(generation) {
                        guard.attempt = None;
                    }
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }
}

/// Drop the connection id and the attempt so the next `connect()` starts
/// fresh.
fn invalidate(state: &Mutex<ConnectionState>) {
    let mut guard = state.lock();
    guard.attempt = None;
    guard.id = None;
}

fn spawn_monitor_task(
    state: Arc<Mutex<ConnectionState>>,
    mut events: broadcast::Receiver<TransportEvent>,
) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(TransportEvent::Error(reason)) => {
                    warn!(%reason, "transport error, connection invalidated");
                    invalidate(&state);
                }
                Ok(TransportEvent::Closed) => {
                    debug!("transport closed, connection invalidated");
                    invalidate(&state);
                }
                Ok(TransportEvent::Message(_)) => {}
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(skipped = n, "connection monitor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        state.lock().monitoring = false;
    });
}
