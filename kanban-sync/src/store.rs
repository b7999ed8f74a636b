//! Optimistic local store.
//!
//! Holds entities written locally before the server has confirmed them, for
//! every resource key in the process. One store is constructed by the
//! [`SyncClient`](crate::SyncClient) and shared by every resource handle, so
//! an optimistic write made through one handle is immediately visible through
//! all others.
//!
//! Each entry remembers the [`RevisionClock`] value at write time. A server
//! state published later carries a higher revision, which is how the
//! reconciler tells a confirmation apart from a stale server copy.

use kanban_sync_types::{Entity, EntityId, ResourceKey};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Process-wide sequence shared by the store and the transports.
///
/// Transports draw a fresh value for every server-originated publication;
/// optimistic writes record the current value.
#[derive(Debug, Default)]
pub struct RevisionClock(AtomicU64);

impl RevisionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// The most recently issued revision.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Issues the next revision.
    pub fn tick(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

/// What an optimistic entry asserts about its id.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimisticWrite {
    /// The entity exists with this content.
    Upsert(Entity),
    /// The entity has been deleted locally.
    Remove,
}

/// A local write awaiting server confirmation.
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticEntry {
    pub write: OptimisticWrite,
    /// Clock value when the write was made, or when its mutation settled.
    pub base_revision: u64,
    /// Set while the mutation request is in flight; a held entry is never
    /// confirmed.
    pub held: bool,
}

impl OptimisticEntry {
    pub fn entity(&self) -> Option<&Entity> {
        match &self.write {
            OptimisticWrite::Upsert(entity) => Some(entity),
            OptimisticWrite::Remove => None,
        }
    }

    pub fn is_removal(&self) -> bool {
        matches!(self.write, OptimisticWrite::Remove)
    }
}

/// Optimistic entries of one resource key, by id.
pub type OptimisticSnapshot = BTreeMap<EntityId, OptimisticEntry>;

/// Kind of change reported to store listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Updated,
    Removed,
    RolledBack,
}

/// A change notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreChange {
    pub key: ResourceKey,
    pub id: EntityId,
    pub kind: ChangeKind,
}

/// Handle returned by [`OptimisticStore::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

/// The shared optimistic store.
pub struct OptimisticStore {
    clock: Arc<RevisionClock>,
    entries: Mutex<HashMap<ResourceKey, OptimisticSnapshot>>,
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
}

impl OptimisticStore {
    /// Creates a store with its own revision clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RevisionClock::new()))
    }

    /// Creates a store sharing a clock with the transports.
    pub fn with_clock(clock: Arc<RevisionClock>) -> Self {
        Self {
            clock,
            entries: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn clock(&self) -> &Arc<RevisionClock> {
        &self.clock
    }

    /// Records a locally created entity.
    pub fn add(&self, key: &ResourceKey, entity: Entity) {
        self.write(key, entity.id().clone(), OptimisticWrite::Upsert(entity), ChangeKind::Added);
    }

    /// Records a local edit of an entity.
    pub fn update(&self, key: &ResourceKey, entity: Entity) {
        self.write(key, entity.id().clone(), OptimisticWrite::Upsert(entity), ChangeKind::Updated);
    }

    /// Records a local deletion. The id stays hidden until the server
    /// confirms it is gone or the removal is rolled back.
    pub fn remove(&self, key: &ResourceKey, id: &EntityId) {
        self.write(key, id.clone(), OptimisticWrite::Remove, ChangeKind::Removed);
    }

    /// Discards the optimistic entry for `id`, restoring the server view.
    /// Returns whether an entry existed.
    pub fn rollback(&self, key: &ResourceKey, id: &EntityId) -> bool {
        let existed = {
            let mut entries = self.lock_entries();
            let removed = entries.get_mut(key).and_then(|m| m.remove(id)).is_some();
            prune(&mut entries, key);
            removed
        };
        if existed {
            debug!("Rolled back optimistic entry {} in {}", id, key);
            self.notify(StoreChange {
                key: key.clone(),
                id: id.clone(),
                kind: ChangeKind::RolledBack,
            });
        }
        existed
    }

    /// Returns a copy of the optimistic entries for `key`.
    pub fn snapshot(&self, key: &ResourceKey) -> OptimisticSnapshot {
        self.lock_entries().get(key).cloned().unwrap_or_default()
    }

    pub fn get(&self, key: &ResourceKey, id: &EntityId) -> Option<OptimisticEntry> {
        self.lock_entries().get(key).and_then(|m| m.get(id)).cloned()
    }

    pub fn contains(&self, key: &ResourceKey, id: &EntityId) -> bool {
        self.get(key, id).is_some()
    }

    /// Number of pending entries for `key`.
    pub fn len(&self, key: &ResourceKey) -> usize {
        self.lock_entries().get(key).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self, key: &ResourceKey) -> bool {
        self.len(key) == 0
    }

    /// Excludes the entry for `id` from confirmation while its mutation
    /// request is pending. Returns whether an entry existed.
    pub fn hold(&self, key: &ResourceKey, id: &EntityId) -> bool {
        let mut entries = self.lock_entries();
        match entries.get_mut(key).and_then(|m| m.get_mut(id)) {
            Some(entry) => {
                entry.held = true;
                true
            }
            None => false,
        }
    }

    /// Releases a held entry after its mutation succeeded.
    ///
    /// The entry is re-stamped with the current revision so only server
    /// states published after the response can confirm it. An upsert takes
    /// the server's copy of the entity when one is given.
    pub fn settle(&self, key: &ResourceKey, id: &EntityId, server_copy: Option<Entity>) -> bool {
        let revision = self.clock.current();
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(key).and_then(|m| m.get_mut(id)) else {
            return false;
        };
        entry.held = false;
        entry.base_revision = revision;
        if let (OptimisticWrite::Upsert(current), Some(server)) = (&mut entry.write, server_copy) {
            *current = server;
        }
        true
    }

    /// Releases a held entry after its mutation failed.
    ///
    /// The original write revision is kept, so any server state published
    /// since the write outranks the rejected entry and confirms it away.
    pub fn release(&self, key: &ResourceKey, id: &EntityId) -> bool {
        let mut entries = self.lock_entries();
        match entries.get_mut(key).and_then(|m| m.get_mut(id)) {
            Some(entry) => {
                entry.held = false;
                true
            }
            None => false,
        }
    }

    /// Drops the entry for `id` outright because the latest server state
    /// already reflects its mutation. Listeners are not notified.
    pub fn resolve(&self, key: &ResourceKey, id: &EntityId) -> bool {
        let mut entries = self.lock_entries();
        let resolved = entries.get_mut(key).and_then(|m| m.remove(id)).is_some();
        prune(&mut entries, key);
        if resolved {
            debug!("Resolved optimistic entry {} in {} on settle", id, key);
        }
        resolved
    }

    /// Removes entries confirmed by a server state at `server_revision`.
    ///
    /// Only unheld entries written before that revision are dropped, so a
    /// write racing the confirmation survives. Listeners are not notified: a
    /// confirmation never changes the merged view.
    pub fn confirm(&self, key: &ResourceKey, ids: &[EntityId], server_revision: u64) -> usize {
        if ids.is_empty() {
            return 0;
        }
        let mut entries = self.lock_entries();
        let Some(map) = entries.get_mut(key) else {
            return 0;
        };
        let mut confirmed = 0;
        for id in ids {
            if map
                .get(id)
                .is_some_and(|entry| !entry.held && entry.base_revision < server_revision)
            {
                map.remove(id);
                confirmed += 1;
            }
        }
        prune(&mut entries, key);
        if confirmed > 0 {
            debug!("Confirmed {} optimistic entries in {}", confirmed, key);
        }
        confirmed
    }

    /// Drops every entry for `key`.
    pub fn clear(&self, key: &ResourceKey) {
        self.lock_entries().remove(key);
    }

    /// Registers a listener called synchronously after every add, update,
    /// remove and rollback, for any key.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&StoreChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.lock_listeners().push((id, Arc::new(listener)));
        id
    }

    /// Unregisters a listener. Returns whether it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.lock_listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn write(&self, key: &ResourceKey, id: EntityId, write: OptimisticWrite, kind: ChangeKind) {
        let entry = OptimisticEntry {
            write,
            base_revision: self.clock.current(),
            held: false,
        };
        self.lock_entries()
            .entry(key.clone())
            .or_default()
            .insert(id.clone(), entry);
        self.notify(StoreChange {
            key: key.clone(),
            id,
            kind,
        });
    }

    // Listeners run on a copy of the registry with no lock held, so they may
    // write to the store or (un)register listeners themselves.
    fn notify(&self, change: StoreChange) {
        let listeners: Vec<Listener> = self
            .lock_listeners()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(&change);
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<ResourceKey, OptimisticSnapshot>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, Listener)>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for OptimisticStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OptimisticStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticStore")
            .field("revision", &self.clock.current())
            .field("keys", &self.lock_entries().len())
            .finish()
    }
}

fn prune(entries: &mut HashMap<ResourceKey, OptimisticSnapshot>, key: &ResourceKey) {
    if entries.get(key).is_some_and(BTreeMap::is_empty) {
        entries.remove(key);
    }
}
