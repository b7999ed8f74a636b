//! Opaque entities and the reconciled per-resource state.
//!
//! The sync core never interprets an entity beyond its `id` field. Everything
//! else travels as raw JSON so the same machinery serves projects, issues and
//! any future resource.

use crate::{EntityId, Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A domain record keyed by its `id` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Entity {
    id: EntityId,
    data: Value,
}

impl Entity {
    /// Builds an entity from a JSON object carrying a string `id`.
    pub fn from_value(data: Value) -> Result<Self> {
        let object = data.as_object().ok_or(Error::NotAnObject)?;
        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or(Error::MissingId)?;
        Ok(Self {
            id: EntityId::new(id),
            data,
        })
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// Returns a top-level field of the entity.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Returns the full JSON representation.
    pub fn as_value(&self) -> &Value {
        &self.data
    }

    pub fn into_value(self) -> Value {
        self.data
    }
}

impl TryFrom<Value> for Entity {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<Entity> for Value {
    fn from(entity: Entity) -> Self {
        entity.data
    }
}

/// The authoritative view of one resource key as last published by the
/// server.
///
/// `revision` increases with every server-originated publication so the
/// reconciler can tell whether a state is newer than an optimistic write.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceState {
    entities: BTreeMap<EntityId, Entity>,
    revision: u64,
}

impl ResourceState {
    /// Creates an empty state at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a state from a set of entities at the given revision.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>, revision: u64) -> Self {
        Self {
            entities: entities.into_iter().map(|e| (e.id().clone(), e)).collect(),
            revision,
        }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn set_revision(&mut self, revision: u64) {
        self.revision = revision;
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    /// Inserts or replaces an entity, returning the previous value.
    pub fn insert(&mut self, entity: Entity) -> Option<Entity> {
        self.entities.insert(entity.id().clone(), entity)
    }

    pub fn remove(&mut self, id: &EntityId) -> Option<Entity> {
        self.entities.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &EntityId> {
        self.entities.keys()
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Borrows the underlying id → entity map.
    pub fn as_map(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }
}
