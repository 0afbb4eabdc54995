//! Per-entity trajectory buffers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::entity::EntityKey;
use crate::error::SyncError;
use crate::notify::Revision;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heading: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

impl TrajectoryPoint {
    /// Extract a point from an entity state or a history record.
    ///
    /// `timestamp` may be an RFC 3339 string or epoch seconds. Short field
    /// names (`lat`, `lon`/`lng`, `alt`, `track`) are accepted.
    pub fn from_state(state: &Value) -> Option<Self> {
        Some(Self {
            timestamp: parse_timestamp(state.get("timestamp")?)?,
            latitude: number(state, &["latitude", "lat"])?,
            longitude: number(state, &["longitude", "lon", "lng"])?,
            altitude: number(state, &["altitude", "alt"]),
            heading: number(state, &["heading", "track"]),
            speed: number(state, &["speed"]),
        })
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Whether `self` is more than `threshold` away in time from `other`,
    /// in either direction.
    pub fn is_apart_from(&self, other: &TrajectoryPoint, threshold: Duration) -> bool {
        let delta = self
            .timestamp
            .timestamp_micros()
            .abs_diff(other.timestamp.timestamp_micros());
        u128::from(delta) > threshold.as_micros()
    }
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(text) => DateTime::parse_from_rfc3339(text)
            .ok()
            .map(|t| t.with_timezone(&Utc)),
        Value::Number(n) => DateTime::from_timestamp_micros((n.as_f64()? * 1_000_000.0).round() as i64),
        _ => None,
    }
}

fn number(state: &Value, names: &[&str]) -> Option<f64> {
    names.iter().find_map(|name| state.get(*name)?.as_f64())
}

/// Decode a list of points, skipping records without a usable position.
pub fn points_from_values(values: &[Value]) -> Vec<TrajectoryPoint> {
    values.iter().filter_map(TrajectoryPoint::from_state).collect()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrajectoryEntry {
    pub points: Arc<Vec<TrajectoryPoint>>,
    pub loading: bool,
    pub error: Option<String>,
}

/// One plugin's trajectory buffers, keyed by entity.
///
/// Point lists are immutable snapshots; every write swaps in a new `Arc`.
#[derive(Default)]
pub struct TrajectoryCache {
    entries: RwLock<HashMap<EntityKey, TrajectoryEntry>>,
    revision: Revision,
}

impl TrajectoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(&self, key: &EntityKey) -> Option<TrajectoryEntry> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &EntityKey) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Current points for `key`, empty when there is no entry.
    pub fn points(&self, key: &EntityKey) -> Arc<Vec<TrajectoryPoint>> {
        self.entries
            .read()
            .get(key)
            .map(|entry| entry.points.clone())
            .unwrap_or_default()
    }

    /// Points of a settled, non-empty entry.
    pub fn ready_points(&self, key: &EntityKey) -> Option<Arc<Vec<TrajectoryPoint>>> {
        self.entries
            .read()
            .get(key)
            .filter(|entry| !entry.loading && !entry.points.is_empty())
            .map(|entry| entry.points.clone())
    }

    pub fn keys(&self) -> Vec<EntityKey> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Create an empty entry unless one exists. Returns whether it was created.
    pub fn insert_empty(&self, key: &EntityKey) -> bool {
        let created = {
            let mut entries = self.entries.write();
            if entries.contains_key(key) {
                false
            } else {
                entries.insert(key.clone(), TrajectoryEntry::default());
                true
            }
        };
        if created {
            self.revision.bump();
        }
        created
    }

    pub fn remove(&self, key: &EntityKey) -> bool {
        let removed = self.entries.write().remove(key).is_some();
        if removed {
            self.revision.bump();
        }
        removed
    }

    /// Replace the entry's points with `points`. Signals a change only when
    /// the content differs.
    pub fn adopt(&self, key: &EntityKey, points: Arc<Vec<TrajectoryPoint>>) -> bool {
        let changed = {
            let mut entries = self.entries.write();
            let entry = entries.entry(key.clone()).or_default();
            let same = Arc::ptr_eq(&entry.points, &points) || *entry.points == *points;
            let changed = !same || entry.loading || entry.error.is_some();
            entry.points = points;
            entry.loading = false;
            entry.error = None;
            changed
        };
        if changed {
            self.revision.bump();
        }
        changed
    }

    pub fn begin_fetch(&self, key: &EntityKey) {
        self.entries
            .write()
            .entry(key.clone())
            .or_default()
            .loading = true;
        self.revision.bump();
    }

    /// Store fetched history in front of the live points accumulated so far
    /// and return the merged list.
    ///
    /// Writes into whatever entry exists when the fetch completes, creating
    /// one if the key was dropped in the meantime.
    pub fn complete_fetch(
        &self,
        key: &EntityKey,
        mut fetched: Vec<TrajectoryPoint>,
    ) -> Arc<Vec<TrajectoryPoint>> {
        let merged = {
            let mut entries = self.entries.write();
            let entry = entries.entry(key.clone()).or_default();
            fetched.extend(entry.points.iter().cloned());
            entry.points = Arc::new(fetched);
            entry.loading = false;
            entry.error = None;
            entry.points.clone()
        };
        self.revision.bump();
        merged
    }

    /// Record a failed fetch. Returns the points the entry still holds.
    pub fn fail_fetch(&self, key: &EntityKey, error: &SyncError) -> Arc<Vec<TrajectoryPoint>> {
        let points = {
            let mut entries = self.entries.write();
            match entries.get_mut(key) {
                Some(entry) => {
                    entry.loading = false;
                    entry.error = Some(error.to_string());
                    entry.points.clone()
                }
                None => return Arc::default(),
            }
        };
        self.revision.bump();
        points
    }

    /// Append a live point when it is more than `threshold` away from the
    /// last cached one. Nothing is written unless the entry exists.
    pub fn append(&self, key: &EntityKey, point: &TrajectoryPoint, threshold: Duration) -> bool {
        let appended = {
            let mut entries = self.entries.write();
            let Some(entry) = entries.get_mut(key) else {
                return false;
            };
            let accept = entry
                .points
                .last()
                .is_none_or(|last| point.is_apart_from(last, threshold));
            if accept {
                Arc::make_mut(&mut entry.points).push(point.clone());
            }
            accept
        };
        if appended {
            self.revision.bump();
        }
        appended
    }

    pub fn revision(&self) -> u64 {
        self.revision.current()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }
}
