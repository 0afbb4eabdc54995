//! Historical trajectory points from the backend.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use crate::entity::EntityKey;
use crate::error::{SyncError, SyncResult};
use crate::realtime::Realtime;
use crate::trajectory::{TrajectoryPoint, points_from_values};

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch(&self, key: &EntityKey) -> SyncResult<Vec<TrajectoryPoint>>;
}

/// History served over the realtime request/response convention.
pub struct RpcHistorySource {
    realtime: Arc<Realtime>,
    topic: String,
    timeout: Duration,
}

impl RpcHistorySource {
    pub fn new(realtime: Arc<Realtime>, topic: impl Into<String>, timeout: Duration) -> Self {
        Self {
            realtime,
            topic: topic.into(),
            timeout,
        }
    }
}

#[async_trait]
impl HistorySource for RpcHistorySource {
    async fn fetch(&self, key: &EntityKey) -> SyncResult<Vec<TrajectoryPoint>> {
        let fail = |message: String| SyncError::HistoryFetch {
            key: key.to_string(),
            message,
        };

        let response = self
            .realtime
            .request(
                &self.topic,
                json!({ "id": key.id, "type": key.entity_type }),
                self.timeout,
            )
            .await
            .map_err(|e| fail(e.to_string()))?;

        let mut points = parse_history(&response).ok_or_else(|| {
            fail("response carries neither a point array nor a `points` field".to_string())
        })?;
        points.sort_by_key(|point| point.timestamp);
        debug!(key = %key, points = points.len(), "history fetched");
        Ok(points)
    }
}

/// Accepts `{"points": [...]}` or a bare array.
fn parse_history(response: &Value) -> Option<Vec<TrajectoryPoint>> {
    match response {
        Value::Array(values) => Some(points_from_values(values)),
        Value::Object(map) => match map.get("points")? {
            Value::Array(values) => Some(points_from_values(values)),
            Value::Null => Some(Vec::new()),
            _ => None,
        },
        Value::Null => Some(Vec::new()),
        _ => None,
    }
}
