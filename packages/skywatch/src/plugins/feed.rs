//! Live feed of one entity type (`entities:<type>`).

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use skywatch_sync::{BackfillCoordinator, EntityBatch, EntityStore, SyncContext, SyncResult};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::plugin::{Plugin, PluginHandle};

pub struct FeedPlugin {
    entity_type: String,
    follow: HashSet<String>,
}

impl FeedPlugin {
    pub fn new(entity_type: impl Into<String>, follow: &[String]) -> Self {
        Self {
            entity_type: entity_type.into(),
            follow: follow.iter().cloned().collect(),
        }
    }

    pub fn topic(&self) -> String {
        format!("entities:{}", self.entity_type)
    }
}

/// Per-plugin state the push handler works on. The store is the context's
/// shared one; only this plugin's type is written.
pub struct FeedState {
    entity_type: String,
    follow: HashSet<String>,
    coordinator: BackfillCoordinator,
}

impl FeedState {
    pub fn new(entity_type: &str, follow: HashSet<String>, coordinator: BackfillCoordinator) -> Self {
        coordinator.store().register_entity_type(entity_type);
        Self {
            entity_type: entity_type.to_string(),
            follow,
            coordinator,
        }
    }

    fn store(&self) -> &Arc<EntityStore> {
        self.coordinator.store()
    }

    /// Apply one push batch. Returns the number of trajectory points appended.
    pub fn apply(&self, payload: &Value) -> SyncResult<usize> {
        let batch = EntityBatch::from_payload(&self.entity_type, payload)?;

        for entity in &batch.entities {
            if self.follow.contains(&entity.id) && !self.store().is_selected(&entity.id) {
                info!(entity_type = %self.entity_type, id = %entity.id, "following entity");
                self.store().select_entity(entity.clone(), false);
            }
        }

        self.store()
            .replace_all_entities_by_type(&self.entity_type, batch.entities.clone());
        if let Some(total) = batch.total {
            self.store().set_total_count(&self.entity_type, total);
        }
        Ok(self.coordinator.on_push_batch(&batch.entities))
    }

    /// Log trajectory sizes whenever the cache changes.
    pub fn spawn_reporter(&self) -> JoinHandle<()> {
        let plugin = self.coordinator.plugin().to_string();
        let cache = self.coordinator.cache().clone();
        let mut changes = cache.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                for key in cache.keys() {
                    let Some(entry) = cache.entry(&key) else {
                        continue;
                    };
                    debug!(
                        plugin = %plugin,
                        key = %key,
                        points = entry.points.len(),
                        loading = entry.loading,
                        error = entry.error.as_deref().unwrap_or(""),
                        "trajectory"
                    );
                }
            }
        })
    }
}

#[async_trait]
impl Plugin for FeedPlugin {
    fn name(&self) -> &str {
        &self.entity_type
    }

    async fn start(&self, ctx: Arc<SyncContext>) -> Result<PluginHandle> {
        let coordinator = ctx.coordinator(&self.entity_type, &self.entity_type);
        let state = Arc::new(FeedState::new(
            &self.entity_type,
            self.follow.clone(),
            coordinator.clone(),
        ));

        let handler_state = state.clone();
        let feed = ctx
            .realtime()
            .spawn_subscription(&self.topic(), move |payload| {
                if let Err(e) = handler_state.apply(payload) {
                    warn!(entity_type = %handler_state.entity_type, error = %e, "dropping push batch");
                }
            })
            .with_context(|| format!("invalid feed topic {}", self.topic()))?;

        Ok(PluginHandle::default()
            .with_task(feed)
            .with_task(coordinator.spawn_selection_watcher())
            .with_task(coordinator.spawn_bus_listener())
            .with_task(state.spawn_reporter()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fake_context, test_context};
    use serde_json::json;
    use skywatch_sync::{EntityKey, TransportEvent};
    use std::time::Duration;

    fn feed(ctx: &SyncContext, entity_type: &str, follow: &[&str]) -> FeedState {
        FeedState::new(
            entity_type,
            follow.iter().map(|s| s.to_string()).collect(),
            ctx.coordinator(entity_type, entity_type),
        )
    }

    fn position(id: &str, ts: f64) -> Value {
        json!({"id": id, "state": {"timestamp": ts, "latitude": 52.0, "longitude": 4.0}})
    }

    async fn eventually(condition: impl Fn() -> bool) {
        for _ in 0..1000 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn topic_is_derived_from_type() {
        assert_eq!(FeedPlugin::new("vessels", &[]).topic(), "entities:vessels");
    }

    #[tokio::test]
    async fn batch_replaces_entities_and_total() {
        let ctx = test_context();
        let state = feed(&ctx, "aircraft", &[]);
        state
            .apply(&json!({"entities": [position("A", 1.0), position("B", 1.0)], "total": 40}))
            .unwrap();
        state
            .apply(&json!({"entities": [position("B", 2.0)]}))
            .unwrap();

        let store = ctx.store();
        assert_eq!(store.visible_count("aircraft"), 1);
        assert_eq!(store.total_count("aircraft"), Some(40));
        assert_eq!(store.entity_types(), vec!["aircraft".to_string()]);
    }

    #[tokio::test]
    async fn followed_ids_are_selected_once() {
        let ctx = test_context();
        let state = feed(&ctx, "aircraft", &["B"]);
        let store = ctx.store();
        let mut selection = store.subscribe_selection();
        state
            .apply(&json!({"entities": [position("A", 1.0), position("B", 1.0)]}))
            .unwrap();
        state.apply(&json!({"entities": [position("B", 2.0)]})).unwrap();

        assert_eq!(store.selected_ids(), vec!["B".to_string()]);
        assert_eq!(*selection.borrow_and_update(), 1);
        assert_eq!(store.selected_entity("B").unwrap().state["timestamp"], 2.0);
    }

    #[tokio::test]
    async fn selected_entities_gain_points() {
        let ctx = test_context();
        let coordinator = ctx.coordinator("aircraft", "aircraft");
        let state = FeedState::new("aircraft", HashSet::from(["A".to_string()]), coordinator.clone());
        let key = EntityKey::new("A", "aircraft");
        coordinator.cache().insert_empty(&key);

        assert_eq!(state.apply(&json!({"entities": [position("A", 1.0)]})).unwrap(), 1);
        assert_eq!(state.apply(&json!({"entities": [position("A", 1.2)]})).unwrap(), 0);
        assert_eq!(state.apply(&json!({"entities": [position("A", 2.0)]})).unwrap(), 1);
        assert_eq!(coordinator.cache().points(&key).len(), 2);
    }

    #[tokio::test]
    async fn malformed_batches_are_rejected() {
        let ctx = test_context();
        let state = feed(&ctx, "aircraft", &[]);
        assert!(state.apply(&json!({"entities": "nope"})).is_err());
        assert_eq!(ctx.store().visible_count("aircraft"), 0);
    }

    #[tokio::test]
    async fn exclusive_selection_clears_other_feeds() {
        let ctx = test_context();
        let aircraft = feed(&ctx, "aircraft", &["A"]);
        let vessels = feed(&ctx, "vessels", &[]);
        aircraft.apply(&json!({"entities": [position("A", 1.0)]})).unwrap();
        vessels.apply(&json!({"entities": [position("V", 1.0)]})).unwrap();
        assert_eq!(ctx.store().selected_ids(), vec!["A".to_string()]);
        assert_eq!(
            aircraft.coordinator.sync_selection(),
            vec![EntityKey::new("A", "aircraft")]
        );
        assert!(vessels.coordinator.sync_selection().is_empty());

        let vessel = ctx.store().entity("vessels", "V").unwrap();
        ctx.store().select_entity(vessel, true);

        assert_eq!(ctx.store().selected_ids(), vec!["V".to_string()]);
        assert!(aircraft.coordinator.sync_selection().is_empty());
        assert!(aircraft.coordinator.cache().is_empty());
        assert_eq!(
            vessels.coordinator.sync_selection(),
            vec![EntityKey::new("V", "vessels")]
        );
        assert_eq!(
            ctx.store().entity_types(),
            vec!["aircraft".to_string(), "vessels".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn feed_keeps_receiving_after_socket_drop() {
        let (ctx, transport) = fake_context();
        let handle = FeedPlugin::new("aircraft", &[]).start(ctx.clone()).await.unwrap();

        eventually(|| transport.join_count("entities") == 1).await;
        let first = ctx.realtime().get_channel("entities").await.unwrap();
        transport.deliver("entities", "aircraft", json!({"entities": [position("A", 1.0)]}));
        eventually(|| ctx.store().visible_count("aircraft") == 1).await;

        transport.emit(TransportEvent::Closed);
        eventually(|| !first.is_joined()).await;

        let mut reattached = false;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if let Ok(channel) = ctx.realtime().get_channel("entities").await {
                if channel.handler_count("aircraft") == 1 {
                    reattached = true;
                    break;
                }
            }
        }
        assert!(reattached);

        transport.deliver(
            "entities",
            "aircraft",
            json!({"entities": [position("A", 2.0), position("B", 2.0)]}),
        );
        eventually(|| ctx.store().visible_count("aircraft") == 2).await;
        handle.shutdown();
    }
}
