//! Trajectory data shared between plugins.
//!
//! Holds the shared point cache, the in-flight backfill fetches, and the bus
//! on which backfills (`trajectory:init`) and live points
//! (`trajectory:append`) are announced.
//!
//! Coordinators register the keys they track with [`TrajectoryExchange::retain`]
//! and give them up with [`TrajectoryExchange::release`]. Shared points are
//! evicted once no coordinator tracks their key, so a key selected again
//! later is backfilled fresh instead of adopting a trajectory with a gap.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use parking_lot::{Mutex, RwLock};
use serde_json::{Value, json};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::bus::{Bus, BusMessage};
use crate::entity::EntityKey;
use crate::error::SyncResult;
use crate::trajectory::{TrajectoryPoint, points_from_values};

pub const TOPIC_GET: &str = "trajectory:get";
pub const TOPIC_INIT: &str = "trajectory:init";
pub const TOPIC_APPEND: &str = "trajectory:append";

/// Origin used for messages published by the exchange itself.
pub const EXCHANGE_ORIGIN: &str = "exchange";

pub type Points = Arc<Vec<TrajectoryPoint>>;
pub(crate) type FetchFuture = Shared<BoxFuture<'static, SyncResult<Points>>>;

/// A trajectory announcement decoded from the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum TrajectoryUpdate {
    Init { key: EntityKey, points: Points },
    Append { key: EntityKey, point: TrajectoryPoint },
}

impl TrajectoryUpdate {
    pub fn from_message(message: &BusMessage) -> Option<Self> {
        let payload = &message.payload;
        let key: EntityKey = serde_json::from_value(payload.clone()).ok()?;
        match message.topic.as_str() {
            TOPIC_INIT => {
                let values = payload.get("points")?.as_array()?;
                Some(Self::Init {
                    key,
                    points: Arc::new(points_from_values(values)),
                })
            }
            TOPIC_APPEND => Some(Self::Append {
                key,
                point: TrajectoryPoint::from_state(payload.get("point")?)?,
            }),
            _ => None,
        }
    }

    pub fn key(&self) -> &EntityKey {
        match self {
            Self::Init { key, .. } | Self::Append { key, .. } => key,
        }
    }
}

pub struct TrajectoryExchange {
    bus: Arc<Bus>,
    shared: RwLock<HashMap<EntityKey, Points>>,
    /// Coordinators (by plugin name) currently tracking each key.
    holders: Mutex<HashMap<EntityKey, HashSet<String>>>,
    pub(crate) in_flight: Mutex<HashMap<EntityKey, FetchFuture>>,
    append_threshold: Duration,
}

impl TrajectoryExchange {
    pub fn new(bus: Arc<Bus>, append_threshold: Duration) -> Self {
        Self {
            bus,
            shared: RwLock::new(HashMap::new()),
            holders: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            append_threshold,
        }
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn append_threshold(&self) -> Duration {
        self.append_threshold
    }

    pub fn shared_points(&self, key: &EntityKey) -> Option<Points> {
        self.shared.read().get(key).cloned()
    }

    pub fn retain(&self, plugin: &str, key: &EntityKey) {
        self.holders
            .lock()
            .entry(key.clone())
            .or_default()
            .insert(plugin.to_string());
    }

    /// Drop `plugin`'s interest in `key`. Returns true when that evicted the
    /// shared points.
    pub fn release(&self, plugin: &str, key: &EntityKey) -> bool {
        let unused = {
            let mut holders = self.holders.lock();
            match holders.get_mut(key) {
                Some(plugins) => {
                    plugins.remove(plugin);
                    let empty = plugins.is_empty();
                    if empty {
                        holders.remove(key);
                    }
                    empty
                }
                None => true,
            }
        };
        if !unused {
            return false;
        }
        let evicted = self.shared.write().remove(key).is_some();
        if evicted {
            trace!(key = %key, "shared trajectory evicted");
        }
        evicted
    }

    pub fn holder_count(&self, key: &EntityKey) -> usize {
        self.holders.lock().get(key).map_or(0, HashSet::len)
    }

    pub fn is_fetching(&self, key: &EntityKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Store a completed backfill and announce it.
    pub fn publish_init(&self, origin: &str, key: &EntityKey, points: Points) {
        self.shared.write().insert(key.clone(), points.clone());
        let values: Vec<Value> = points.iter().map(TrajectoryPoint::to_value).collect();
        let delivered = self.bus.publish(
            TOPIC_INIT,
            origin,
            json!({ "id": key.id, "type": key.entity_type, "points": values }),
        );
        debug!(key = %key, points = points.len(), delivered, "trajectory published");
    }

    /// Extend the shared trajectory with a live point and announce it.
    pub fn publish_append(&self, origin: &str, key: &EntityKey, point: &TrajectoryPoint) {
        {
            let mut shared = self.shared.write();
            if let Some(points) = shared.get_mut(key) {
                let accept = points
                    .last()
                    .is_none_or(|last| point.is_apart_from(last, self.append_threshold));
                if accept {
                    Arc::make_mut(points).push(point.clone());
                }
            }
        }
        self.bus.publish(
            TOPIC_APPEND,
            origin,
            json!({ "id": key.id, "type": key.entity_type, "point": point.to_value() }),
        );
    }

    /// Ask whoever answers `trajectory:get` for the points of `key`.
    pub async fn get(
        &self,
        origin: &str,
        key: &EntityKey,
        timeout: Duration,
    ) -> SyncResult<Option<Vec<TrajectoryPoint>>> {
        let response = self
            .bus
            .request(
                TOPIC_GET,
                origin,
                json!({ "id": key.id, "type": key.entity_type }),
                timeout,
            )
            .await?;
        Ok(response
            .get("points")
            .and_then(Value::as_array)
            .map(|values| points_from_values(values)))
    }

    /// Answer `trajectory:get` requests from the shared cache.
    pub fn spawn_responder(self: &Arc<Self>) -> JoinHandle<()> {
        let exchange = self.clone();
        let mut requests = self.bus.subscribe(TOPIC_GET);
        tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(request) => exchange.answer(&request),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "trajectory responder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn answer(&self, request: &BusMessage) {
        let Ok(key) = serde_json::from_value::<EntityKey>(request.payload.clone()) else {
            trace!(origin = %request.origin, "ignoring malformed trajectory request");
            return;
        };
        let points = self.shared_points(&key).map(|points| {
            points
                .iter()
                .map(TrajectoryPoint::to_value)
                .collect::<Vec<_>>()
        });
        self.bus.respond(
            request,
            EXCHANGE_ORIGIN,
            json!({ "id": key.id, "type": key.entity_type, "points": points }),
        );
    }
}
