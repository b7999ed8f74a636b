//! Merging optimistic entries with server state.

use crate::store::{OptimisticSnapshot, OptimisticStore, OptimisticWrite};
use kanban_sync_types::{Entity, EntityId, ResourceKey, ResourceState};
use std::collections::BTreeMap;

/// The consumer-facing view of one resource key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedState {
    entities: BTreeMap<EntityId, Entity>,
    server_revision: Option<u64>,
}

impl MergedState {
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.entities.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Revision of the server state this view was built on, if any.
    pub fn server_revision(&self) -> Option<u64> {
        self.server_revision
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn as_map(&self) -> &BTreeMap<EntityId, Entity> {
        &self.entities
    }

    pub fn into_map(self) -> BTreeMap<EntityId, Entity> {
        self.entities
    }
}

/// Outcome of a pure merge.
#[derive(Debug, Clone, PartialEq)]
pub struct Merge {
    pub merged: MergedState,
    /// Optimistic ids the server state confirms.
    pub confirmed: Vec<EntityId>,
}

/// Stateless reconciliation of optimistic and server state.
pub struct Reconciler;

impl Reconciler {
    /// Merges without touching the store.
    ///
    /// The server state is the base. An unheld optimistic entry is confirmed
    /// when the server state is newer than the write and agrees with it (the id is
    /// present for an upsert, absent for a removal); confirmed entries defer
    /// to the server copy. Unconfirmed upserts overlay the server copy and
    /// unconfirmed removals hide it. Optimistic-only entities are never
    /// dropped.
    pub fn merge(optimistic: &OptimisticSnapshot, server: Option<&ResourceState>) -> Merge {
        let mut entities = server.map(|s| s.as_map().clone()).unwrap_or_default();
        let mut confirmed = Vec::new();

        for (id, entry) in optimistic {
            let newer =
                !entry.held && server.is_some_and(|s| s.revision() > entry.base_revision);
            let on_server = server.is_some_and(|s| s.contains(id));

            match &entry.write {
                OptimisticWrite::Upsert(entity) => {
                    if newer && on_server {
                        confirmed.push(id.clone());
                    } else {
                        entities.insert(id.clone(), entity.clone());
                    }
                }
                OptimisticWrite::Remove => {
                    if newer && !on_server {
                        confirmed.push(id.clone());
                    } else {
                        entities.remove(id);
                    }
                }
            }
        }

        Merge {
            merged: MergedState {
                entities,
                server_revision: server.map(ResourceState::revision),
            },
            confirmed,
        }
    }

    /// Merges the store's entries for `key` with `server` and drops the
    /// entries the server confirms.
    pub fn reconcile(
        store: &OptimisticStore,
        key: &ResourceKey,
        server: Option<&ResourceState>,
    ) -> MergedState {
        let Merge { merged, confirmed } = Self::merge(&store.snapshot(key), server);
        if let Some(state) = server {
            store.confirm(key, &confirmed, state.revision());
        }
        merged
    }
}
