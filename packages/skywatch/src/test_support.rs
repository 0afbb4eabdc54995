use std::sync::Arc;

use async_trait::async_trait;
use skywatch_sync::test_helpers::{FakeTokenSource, FakeTransport};
use skywatch_sync::{
    EntityKey, HistorySource, Realtime, SyncConfig, SyncContext, SyncResult, TrajectoryPoint,
};

/// History backend that knows nothing.
pub struct EmptyHistory;

#[async_trait]
impl HistorySource for EmptyHistory {
    async fn fetch(&self, _key: &EntityKey) -> SyncResult<Vec<TrajectoryPoint>> {
        Ok(Vec::new())
    }
}

/// Context pointed at an unreachable backend. Subscriptions keep retrying
/// until the test shuts them down.
pub fn test_context() -> Arc<SyncContext> {
    let config = SyncConfig {
        base_url: "http://127.0.0.1:9/api".to_string(),
        socket_url: "ws://127.0.0.1:9/socket/websocket".to_string(),
        ..SyncConfig::default()
    };
    let realtime = Arc::new(Realtime::from_config(&config));
    Arc::new(SyncContext::new(config, realtime, Arc::new(EmptyHistory)))
}

/// Context over an in-memory transport the test drives directly.
pub fn fake_context() -> (Arc<SyncContext>, Arc<FakeTransport>) {
    let config = SyncConfig::default();
    let transport = Arc::new(FakeTransport::new());
    let realtime = Arc::new(Realtime::new(
        transport.clone(),
        Arc::new(FakeTokenSource::new()),
        &config,
    ));
    let ctx = SyncContext::new(config, realtime, Arc::new(EmptyHistory));
    (Arc::new(ctx), transport)
}
