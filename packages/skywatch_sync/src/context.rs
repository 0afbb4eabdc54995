use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::backfill::BackfillCoordinator;
use crate::bus::Bus;
use crate::config::SyncConfig;
use crate::entity::EntityStore;
use crate::exchange::TrajectoryExchange;
use crate::history::{HistorySource, RpcHistorySource};
use crate::realtime::Realtime;

/// Everything plugins share, built once by the host and handed to each
/// plugin by `Arc`.
///
/// The entity store is shared too: every plugin registers its own type in
/// it, and the selection spans all types.
pub struct SyncContext {
    config: SyncConfig,
    realtime: Arc<Realtime>,
    store: Arc<EntityStore>,
    exchange: Arc<TrajectoryExchange>,
    history: Arc<dyn HistorySource>,
}

impl SyncContext {
    pub fn new(
        config: SyncConfig,
        realtime: Arc<Realtime>,
        history: Arc<dyn HistorySource>,
    ) -> Self {
        let bus = Arc::new(Bus::new(config.bus_capacity));
        let exchange = Arc::new(TrajectoryExchange::new(bus, config.append_dedup_threshold));
        Self {
            config,
            realtime,
            store: Arc::new(EntityStore::new()),
            exchange,
            history,
        }
    }

    /// Context talking to the configured backend over WebSocket, with history
    /// fetched over the same connection.
    pub fn connect(config: SyncConfig) -> Self {
        let realtime = Arc::new(Realtime::from_config(&config));
        let history = Arc::new(RpcHistorySource::new(
            realtime.clone(),
            config.history_topic.clone(),
            config.history_timeout,
        ));
        Self::new(config, realtime, history)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn realtime(&self) -> &Arc<Realtime> {
        &self.realtime
    }

    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    pub fn exchange(&self) -> &Arc<TrajectoryExchange> {
        &self.exchange
    }

    pub fn bus(&self) -> &Arc<Bus> {
        self.exchange.bus()
    }

    /// Start answering `trajectory:get` from the shared cache.
    pub fn spawn_trajectory_responder(&self) -> JoinHandle<()> {
        self.exchange.spawn_responder()
    }

    /// Backfill coordinator for `plugin`, tracking selected entities of
    /// `entity_type` in the shared store.
    pub fn coordinator(&self, plugin: &str, entity_type: &str) -> BackfillCoordinator {
        BackfillCoordinator::new(
            plugin,
            self.store.clone(),
            self.exchange.clone(),
            self.history.clone(),
        )
        .with_entity_type(entity_type)
    }
}
