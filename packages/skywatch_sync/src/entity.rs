//! Entity store: visible entities per type, a cross-type selection set and
//! per-type total counts.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{SyncError, SyncResult};
use crate::notify::Revision;

/// Identity of one entity across plugins.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
}

impl EntityKey {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    /// Opaque state as pushed by the backend.
    #[serde(default)]
    pub state: Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>, state: Value) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            state,
        }
    }

    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.id, &self.entity_type)
    }
}

/// One push from an `entities:<type>` stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityBatch {
    #[serde(default)]
    pub entities: Vec<Entity>,
    /// Entities of this type known to the backend, visible or not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

impl EntityBatch {
    /// Decode a push payload. Entities without a `type` inherit
    /// `entity_type`.
    pub fn from_payload(entity_type: &str, payload: &Value) -> SyncResult<Self> {
        let mut batch: EntityBatch = serde_json::from_value(payload.clone())
            .map_err(|e| SyncError::Payload(format!("{entity_type} batch: {e}")))?;
        for entity in &mut batch.entities {
            if entity.entity_type.is_empty() {
                entity.entity_type = entity_type.to_string();
            }
        }
        Ok(batch)
    }
}

#[derive(Default)]
struct StoreInner {
    tables: HashMap<String, HashMap<String, Entity>>,
    selection: HashMap<String, Entity>,
    totals: HashMap<String, u64>,
}

/// Entities currently in view, grouped by type, plus the selection.
///
/// Selection has its own lifecycle: replacing a type's entities refreshes
/// selected entries still present in the batch and leaves the others alone.
#[derive(Default)]
pub struct EntityStore {
    inner: RwLock<StoreInner>,
    changes: Revision,
    selection_changes: Revision,
}

impl EntityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity_type(&self, entity_type: &str) {
        let inserted = {
            let mut inner = self.inner.write();
            if inner.tables.contains_key(entity_type) {
                false
            } else {
                inner.tables.insert(entity_type.to_string(), HashMap::new());
                true
            }
        };
        if inserted {
            debug!(entity_type, "entity type registered");
            self.changes.bump();
        }
    }

    pub fn replace_all_entities_by_type(&self, entity_type: &str, entities: Vec<Entity>) {
        {
            let mut inner = self.inner.write();
            let table: HashMap<String, Entity> = entities
                .into_iter()
                .map(|entity| (entity.id.clone(), entity))
                .collect();
            let StoreInner {
                tables, selection, ..
            } = &mut *inner;
            for selected in selection.values_mut() {
                if selected.entity_type != entity_type {
                    continue;
                }
                if let Some(fresh) = table.get(&selected.id) {
                    *selected = fresh.clone();
                }
            }
            tables.insert(entity_type.to_string(), table);
        }
        self.changes.bump();
    }

    /// Select `entity`. Exclusive selection replaces the whole set.
    pub fn select_entity(&self, entity: Entity, exclusive: bool) {
        {
            let mut inner = self.inner.write();
            if exclusive {
                inner.selection.clear();
            }
            inner.selection.insert(entity.id.clone(), entity);
        }
        self.selection_changed();
    }

    pub fn deselect_entity(&self, id: &str) -> bool {
        let removed = self.inner.write().selection.remove(id).is_some();
        if removed {
            self.selection_changed();
        }
        removed
    }

    pub fn clear_selection(&self) {
        let had_any = {
            let mut inner = self.inner.write();
            let had_any = !inner.selection.is_empty();
            inner.selection.clear();
            had_any
        };
        if had_any {
            self.selection_changed();
        }
    }

    pub fn set_total_count(&self, entity_type: &str, total: u64) {
        let previous = self
            .inner
            .write()
            .totals
            .insert(entity_type.to_string(), total);
        if previous != Some(total) {
            self.changes.bump();
        }
    }

    pub fn entity_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.inner.read().tables.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn entities(&self, entity_type: &str) -> Vec<Entity> {
        let inner = self.inner.read();
        let mut entities: Vec<Entity> = inner
            .tables
            .get(entity_type)
            .map(|table| table.values().cloned().collect())
            .unwrap_or_default();
        entities.sort_by(|a, b| a.id.cmp(&b.id));
        entities
    }

    pub fn entity(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.inner
            .read()
            .tables
            .get(entity_type)
            .and_then(|table| table.get(id))
            .cloned()
    }

    pub fn visible_count(&self, entity_type: &str) -> usize {
        self.inner.read().tables.get(entity_type).map_or(0, HashMap::len)
    }

    pub fn total_count(&self, entity_type: &str) -> Option<u64> {
        self.inner.read().totals.get(entity_type).copied()
    }

    pub fn selection(&self) -> Vec<Entity> {
        let mut selection: Vec<Entity> = self.inner.read().selection.values().cloned().collect();
        selection.sort_by(|a, b| a.id.cmp(&b.id));
        selection
    }

    pub fn selected_entity(&self, id: &str) -> Option<Entity> {
        self.inner.read().selection.get(id).cloned()
    }

    pub fn selected_ids(&self) -> Vec<String> {
        let ids: BTreeSet<String> = self.inner.read().selection.keys().cloned().collect();
        ids.into_iter().collect()
    }

    pub fn selected_keys(&self) -> BTreeSet<EntityKey> {
        self.inner
            .read()
            .selection
            .values()
            .map(Entity::key)
            .collect()
    }

    pub fn is_selected(&self, id: &str) -> bool {
        self.inner.read().selection.contains_key(id)
    }

    /// Notified on every mutation.
    pub fn subscribe_changes(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Notified when selection membership changes.
    pub fn subscribe_selection(&self) -> watch::Receiver<u64> {
        self.selection_changes.subscribe()
    }

    fn selection_changed(&self) {
        self.selection_changes.bump();
        self.changes.bump();
    }
}
