//! Stream protocol messages and the document they build.
//!
//! The first message of a connection is a full snapshot shaped
//! `{ "<snapshot_key>": { "<id>": entity, ... } }`. Every later message is
//! a batch of JSON-Patch operations against that document, either as a bare
//! array or wrapped as `{ "JsonPatch": [...] }`. `{ "finished": true }`
//! ends the stream.

use super::patch::{apply_patch, parse_pointer};
use crate::error::{SyncError, SyncResult};
use kanban_sync_types::{Entity, EntityId, PatchOperation, ResourceKind, ResourceState};
use serde_json::{Map, Value};

/// A decoded stream message.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamMessage {
    Snapshot(Value),
    Patch(Vec<PatchOperation>),
    Finished,
}

impl StreamMessage {
    pub fn decode(text: &str) -> SyncResult<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("undecodable message: {e}")))?;
        match value {
            Value::Array(_) => Ok(StreamMessage::Patch(decode_ops(value)?)),
            Value::Object(mut map) => {
                if let Some(ops) = map.remove("JsonPatch") {
                    return Ok(StreamMessage::Patch(decode_ops(ops)?));
                }
                if map.get("finished").and_then(Value::as_bool) == Some(true) {
                    return Ok(StreamMessage::Finished);
                }
                Ok(StreamMessage::Snapshot(Value::Object(map)))
            }
            other => Err(SyncError::Protocol(format!(
                "unexpected message type: {}",
                json_type(&other)
            ))),
        }
    }

    /// Whether a patch batch replaces the whole document, which makes it
    /// acceptable in place of a snapshot.
    pub fn is_root_replacement(&self) -> bool {
        matches!(self, StreamMessage::Patch(ops)
            if ops.first().is_some_and(|op| op.path.is_empty() && op.value.is_some()))
    }
}

fn decode_ops(value: Value) -> SyncResult<Vec<PatchOperation>> {
    serde_json::from_value(value)
        .map_err(|e| SyncError::Protocol(format!("malformed patch batch: {e}")))
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// The document reconstructed from a snapshot and the patches since.
#[derive(Debug, Clone)]
pub struct StreamDocument {
    kind: ResourceKind,
    doc: Value,
    state: ResourceState,
}

impl StreamDocument {
    /// Starts a document from a snapshot message.
    pub fn from_snapshot(kind: ResourceKind, snapshot: Value, revision: u64) -> SyncResult<Self> {
        let mut document = Self {
            kind,
            doc: snapshot,
            state: ResourceState::new(),
        };
        document.rebuild()?;
        document.state.set_revision(revision);
        Ok(document)
    }

    /// Starts from an empty document; only a root replacement may follow.
    pub fn empty(kind: ResourceKind) -> Self {
        Self {
            kind,
            doc: Value::Null,
            state: ResourceState::new(),
        }
    }

    /// Applies a batch in order and refreshes the entities it touched.
    pub fn apply(&mut self, ops: &[PatchOperation], revision: u64) -> SyncResult<()> {
        apply_patch(&mut self.doc, ops)?;

        let key = self.kind.snapshot_key();
        let mut touched = Vec::new();
        let mut full = false;
        for op in ops {
            let tokens = parse_pointer(&op.path)?;
            match tokens.as_slice() {
                [] => full = true,
                [root] if root == key => full = true,
                [root, id, ..] if root == key => touched.push(EntityId::new(id.as_str())),
                _ => {}
            }
        }

        if full {
            self.rebuild()?;
        } else {
            for id in touched {
                self.refresh(&id)?;
            }
        }
        self.state.set_revision(revision);
        Ok(())
    }

    pub fn state(&self) -> &ResourceState {
        &self.state
    }

    pub fn document(&self) -> &Value {
        &self.doc
    }

    fn entities(&self) -> SyncResult<&Map<String, Value>> {
        let key = self.kind.snapshot_key();
        self.doc
            .get(key)
            .and_then(Value::as_object)
            .ok_or_else(|| SyncError::Protocol(format!("snapshot has no '{key}' map")))
    }

    fn rebuild(&mut self) -> SyncResult<()> {
        let mut state = ResourceState::new();
        for (id, value) in self.entities()? {
            state.insert(entity_at(id, value)?);
        }
        self.state = state;
        Ok(())
    }

    fn refresh(&mut self, id: &EntityId) -> SyncResult<()> {
        match self.entities()?.get(id.as_str()) {
            Some(value) => {
                let entity = entity_at(id.as_str(), value)?;
                self.state.insert(entity);
            }
            None => {
                self.state.remove(id);
            }
        }
        Ok(())
    }
}

/// Builds the entity stored under map key `id`, taking the id from the key
/// when the object omits it.
fn entity_at(id: &str, value: &Value) -> SyncResult<Entity> {
    let mut value = value.clone();
    match value.as_object_mut() {
        Some(object) => {
            object
                .entry("id")
                .or_insert_with(|| Value::String(id.to_string()));
        }
        None => {
            return Err(SyncError::Protocol(format!(
                "entity '{id}' is not an object"
            )));
        }
    }
    Ok(Entity::from_value(value)?)
}
