//! Backfill coordination for one plugin.
//!
//! `ensure_trajectory` guarantees at most one history fetch per entity key at
//! a time across every plugin sharing the same [`TrajectoryExchange`]. Fetches
//! are spawned and are not cancelled when the selection changes: a late
//! completion writes into whatever entry exists at that point.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::entity::{Entity, EntityKey, EntityStore};
use crate::error::SyncError;
use crate::exchange::{FetchFuture, Points, TOPIC_APPEND, TOPIC_INIT, TrajectoryExchange, TrajectoryUpdate};
use crate::history::HistorySource;
use crate::trajectory::{TrajectoryCache, TrajectoryPoint};

#[derive(Clone)]
pub struct BackfillCoordinator {
    plugin: String,
    /// Only selected entities of this type are tracked; `None` tracks all.
    entity_type: Option<String>,
    store: Arc<EntityStore>,
    cache: Arc<TrajectoryCache>,
    exchange: Arc<TrajectoryExchange>,
    history: Arc<dyn HistorySource>,
}

impl BackfillCoordinator {
    pub fn new(
        plugin: impl Into<String>,
        store: Arc<EntityStore>,
        exchange: Arc<TrajectoryExchange>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        Self {
            plugin: plugin.into(),
            entity_type: None,
            store,
            cache: Arc::new(TrajectoryCache::new()),
            exchange,
            history,
        }
    }

    /// Restrict selection tracking and live appends to `entity_type`, for
    /// coordinators sharing one store with plugins of other types.
    pub fn with_entity_type(mut self, entity_type: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    pub fn entity_type(&self) -> Option<&str> {
        self.entity_type.as_deref()
    }

    fn tracks(&self, entity_type: &str) -> bool {
        self.entity_type
            .as_deref()
            .is_none_or(|tracked| tracked == entity_type)
    }

    pub fn cache(&self) -> &Arc<TrajectoryCache> {
        &self.cache
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    fn threshold(&self) -> Duration {
        self.exchange.append_threshold()
    }

    /// Resolve the trajectory of `key`, fetching history at most once.
    ///
    /// Never fails: on a fetch error the entry records the error and the
    /// points it already holds are returned.
    pub async fn ensure_trajectory(&self, key: &EntityKey) -> Points {
        if let Some(shared) = self.exchange.shared_points(key) {
            if self.cache.adopt(key, shared.clone()) {
                debug!(plugin = %self.plugin, key = %key, "adopted shared trajectory");
            }
            return shared;
        }

        let (pending, issued) = {
            let mut in_flight = self.exchange.in_flight.lock();
            if let Some(pending) = in_flight.get(key) {
                (pending.clone(), false)
            } else if let Some(points) = self.cache.ready_points(key) {
                return points;
            } else {
                let pending = self.spawn_fetch(key.clone());
                in_flight.insert(key.clone(), pending.clone());
                (pending, true)
            }
        };

        match pending.await {
            Ok(points) => {
                if !issued {
                    self.cache.adopt(key, points.clone());
                }
                points
            }
            Err(e) if issued => {
                trace!(plugin = %self.plugin, key = %key, error = %e, "backfill failed");
                self.cache.points(key)
            }
            Err(e) => self.cache.fail_fetch(key, &e),
        }
    }

    fn spawn_fetch(&self, key: EntityKey) -> FetchFuture {
        self.cache.begin_fetch(&key);
        info!(plugin = %self.plugin, key = %key, "backfilling trajectory");

        let plugin = self.plugin.clone();
        let cache = self.cache.clone();
        let exchange = self.exchange.clone();
        let history = self.history.clone();
        let task_key = key.clone();

        let handle = tokio::spawn(async move {
            let key = task_key;
            let outcome = match history.fetch(&key).await {
                Ok(fetched) => {
                    let fetched_len = fetched.len();
                    let merged = cache.complete_fetch(&key, fetched);
                    exchange.publish_init(&plugin, &key, merged.clone());
                    debug!(plugin = %plugin, key = %key, fetched = fetched_len, total = merged.len(), "backfill complete");
                    Ok(merged)
                }
                Err(e) => {
                    warn!(plugin = %plugin, key = %key, error = %e, "backfill failed");
                    cache.fail_fetch(&key, &e);
                    Err(e)
                }
            };
            exchange.in_flight.lock().remove(&key);
            outcome
        });

        let exchange = self.exchange.clone();
        async move {
            handle.await.unwrap_or_else(|e| {
                exchange.in_flight.lock().remove(&key);
                Err(SyncError::from(e))
            })
        }
        .boxed()
        .shared()
    }

    /// Live append path for one push batch: selected entities gain a point
    /// when their timestamp moved past the dedup threshold. Returns how many
    /// points were appended.
    pub fn on_push_batch(&self, entities: &[Entity]) -> usize {
        let mut appended = 0;
        for entity in entities {
            if !self.tracks(&entity.entity_type) {
                continue;
            }
            let selected = self
                .store
                .selected_entity(&entity.id)
                .is_some_and(|selected| selected.entity_type == entity.entity_type);
            if !selected {
                continue;
            }
            let Some(point) = TrajectoryPoint::from_state(&entity.state) else {
                trace!(id = %entity.id, "state carries no position");
                continue;
            };
            let key = entity.key();
            if self.cache.append(&key, &point, self.threshold()) {
                self.exchange.publish_append(&self.plugin, &key, &point);
                appended += 1;
            }
        }
        appended
    }

    /// Drop entries for deselected keys and start backfills for newly
    /// selected ones. Returns the keys that were added.
    pub fn sync_selection(&self) -> Vec<EntityKey> {
        let selected: BTreeSet<EntityKey> = self
            .store
            .selected_keys()
            .into_iter()
            .filter(|key| self.tracks(&key.entity_type))
            .collect();
        let cached: BTreeSet<EntityKey> = self.cache.keys().into_iter().collect();

        for key in cached.difference(&selected) {
            self.cache.remove(key);
            self.exchange.release(&self.plugin, key);
            trace!(plugin = %self.plugin, key = %key, "trajectory dropped");
        }

        let added: Vec<EntityKey> = selected.difference(&cached).cloned().collect();
        for key in &added {
            self.exchange.retain(&self.plugin, key);
            self.cache.insert_empty(key);
            let coordinator = self.clone();
            let key = key.clone();
            tokio::spawn(async move {
                coordinator.ensure_trajectory(&key).await;
            });
        }
        added
    }

    /// Re-sync trajectories whenever the selection changes.
    pub fn spawn_selection_watcher(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut selection = self.store.subscribe_selection();
        tokio::spawn(async move {
            coordinator.sync_selection();
            while selection.changed().await.is_ok() {
                let added = coordinator.sync_selection();
                if !added.is_empty() {
                    debug!(plugin = %coordinator.plugin, added = added.len(), "selection changed");
                }
            }
        })
    }

    /// Apply trajectory announcements from other plugins to the local cache.
    pub fn spawn_bus_listener(&self) -> JoinHandle<()> {
        let coordinator = self.clone();
        let mut init = self.exchange.bus().subscribe(TOPIC_INIT);
        let mut append = self.exchange.bus().subscribe(TOPIC_APPEND);
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    message = init.recv() => message,
                    message = append.recv() => message,
                };
                match received {
                    Ok(message) if message.origin == coordinator.plugin => {}
                    Ok(message) => match TrajectoryUpdate::from_message(&message) {
                        Some(update) => coordinator.apply_update(update),
                        None => trace!(topic = %message.topic, "ignoring malformed trajectory update"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(plugin = %coordinator.plugin, skipped = n, "trajectory listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn apply_update(&self, update: TrajectoryUpdate) {
        match update {
            TrajectoryUpdate::Init { key, points } => {
                if self.cache.contains(&key) && !self.exchange.is_fetching(&key) {
                    self.cache.adopt(&key, points);
                }
            }
            TrajectoryUpdate::Append { key, point } => {
                self.cache.append(&key, &point, self.threshold());
            }
        }
    }
}
