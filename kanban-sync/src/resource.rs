//! Per-resource handle: the reconciled view plus mutations.

use crate::api::ResourceApi;
use crate::auth::TokenProvider;
use crate::error::{SyncError, SyncResult};
use crate::reconcile::Reconciler;
use crate::store::{ListenerId, OptimisticStore};
use crate::transport::{EntityChange, FeedState, Transport, TransportMode};
use chrono::{DateTime, FixedOffset};
use kanban_sync_types::{Entity, EntityId, ResourceKey};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{Notify, watch};
use tracing::{debug, warn};

/// What a consumer renders for one resource key.
#[derive(Debug, Clone, Default)]
pub struct ResourceView {
    /// Entities sorted by the kind's sort field, newest first, ties by id.
    pub items: Vec<Entity>,
    pub by_id: BTreeMap<EntityId, Entity>,
    /// True until the first server state has arrived.
    pub is_loading: bool,
    pub is_connected: bool,
    pub error: Option<Arc<SyncError>>,
}

impl ResourceView {
    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.by_id.get(id)
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// A consumer's attachment to one resource key.
///
/// Dropping the handle releases the attachment; the feed stops when the
/// last handle for its key is gone.
pub struct ResourceHandle {
    key: ResourceKey,
    transport: Arc<dyn Transport>,
    store: Arc<OptimisticStore>,
    api: Arc<dyn ResourceApi>,
    tokens: Arc<dyn TokenProvider>,
    rollback_on_error: bool,
    feed: watch::Receiver<FeedState>,
    store_changed: Arc<Notify>,
    listener: ListenerId,
}

impl ResourceHandle {
    pub(crate) fn attach(
        key: ResourceKey,
        transport: Arc<dyn Transport>,
        store: Arc<OptimisticStore>,
        api: Arc<dyn ResourceApi>,
        tokens: Arc<dyn TokenProvider>,
        rollback_on_error: bool,
    ) -> Self {
        let feed = transport.attach(&key);
        let store_changed = Arc::new(Notify::new());
        let listener = {
            let signal = Arc::clone(&store_changed);
            let watched = key.clone();
            store.on_change(move |change| {
                if change.key == watched {
                    signal.notify_one();
                }
            })
        };
        debug!("Attached {} over {}", key, transport.mode());

        Self {
            key,
            transport,
            store,
            api,
            tokens,
            rollback_on_error,
            feed,
            store_changed,
            listener,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn mode(&self) -> TransportMode {
        self.transport.mode()
    }

    /// The latest feed publication, without optimistic entries.
    pub fn feed(&self) -> FeedState {
        self.feed.borrow().clone()
    }

    /// Reconciles the latest server state with pending optimistic writes.
    pub fn view(&self) -> ResourceView {
        let feed = self.feed();
        let merged = Reconciler::reconcile(&self.store, &self.key, feed.state.as_deref());

        let sort_field = self.key.kind().sort_field();
        let mut items: Vec<Entity> = merged.entities().cloned().collect();
        items.sort_by(|a, b| compare_newest_first(a, b, sort_field));

        ResourceView {
            items,
            by_id: merged.into_map(),
            is_loading: feed.state.is_none(),
            is_connected: feed.connected,
            error: feed.error,
        }
    }

    /// Creates an entity. It is visible immediately; the returned entity is
    /// the server's copy.
    pub async fn add(&self, entity: Entity) -> SyncResult<Entity> {
        let id = entity.id().clone();
        self.store.add(&self.key, entity.clone());
        self.begin(&id, EntityChange::Upsert(entity.clone()));

        let result = match self.token().await {
            Ok(token) => self.api.create(&self.key, &entity, &token).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(server) => {
                self.confirmed(&id, EntityChange::Upsert(server.clone()));
                Ok(server)
            }
            Err(error) => Err(self.failed(&id, error)),
        }
    }

    /// Replaces an entity.
    pub async fn update(&self, entity: Entity) -> SyncResult<Entity> {
        let id = entity.id().clone();
        self.store.update(&self.key, entity.clone());
        self.begin(&id, EntityChange::Upsert(entity.clone()));

        let result = match self.token().await {
            Ok(token) => self.api.update(&self.key, &entity, &token).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(server) => {
                self.confirmed(&id, EntityChange::Upsert(server.clone()));
                Ok(server)
            }
            Err(error) => Err(self.failed(&id, error)),
        }
    }

    /// Deletes an entity. It disappears immediately.
    pub async fn remove(&self, id: &EntityId) -> SyncResult<()> {
        self.store.remove(&self.key, id);
        self.begin(id, EntityChange::Remove(id.clone()));

        let result = match self.token().await {
            Ok(token) => self.api.delete(&self.key, id, &token).await,
            Err(error) => Err(error),
        };
        match result {
            Ok(()) => {
                self.confirmed(id, EntityChange::Remove(id.clone()));
                Ok(())
            }
            Err(error) => Err(self.failed(id, error)),
        }
    }

    /// Asks the transport for a fresh server view.
    pub fn refetch(&self) {
        self.transport.refetch(&self.key);
    }

    /// Waits until the feed publishes or the optimistic store changes for
    /// this key.
    pub async fn changed(&mut self) -> SyncResult<()> {
        tokio::select! {
            result = self.feed.changed() => result.map_err(|_| SyncError::ChannelClosed),
            _ = self.store_changed.notified() => Ok(()),
        }
    }

    /// Waits until the view satisfies `predicate` and returns it.
    pub async fn wait_for<F>(&mut self, predicate: F) -> SyncResult<ResourceView>
    where
        F: Fn(&ResourceView) -> bool,
    {
        loop {
            let view = self.view();
            if predicate(&view) {
                return Ok(view);
            }
            self.changed().await?;
        }
    }

    fn begin(&self, id: &EntityId, change: EntityChange) {
        self.store.hold(&self.key, id);
        self.transport.apply_local(&self.key, &change);
    }

    fn confirmed(&self, id: &EntityId, change: EntityChange) {
        let server_copy = match &change {
            EntityChange::Upsert(entity) => Some(entity.clone()),
            EntityChange::Remove(_) => None,
        };
        if self.already_published(&change) {
            self.store.resolve(&self.key, id);
        } else {
            self.store.settle(&self.key, id, server_copy);
        }
        self.transport.confirm(&self.key, &change);
    }

    /// Whether the latest feed state already shows the outcome of `change`.
    fn already_published(&self, change: &EntityChange) -> bool {
        let feed = self.feed.borrow();
        let Some(state) = feed.state.as_deref() else {
            return false;
        };
        match change {
            EntityChange::Upsert(entity) => state.get(entity.id()) == Some(entity),
            EntityChange::Remove(id) => !state.contains(id),
        }
    }

    fn failed(&self, id: &EntityId, error: SyncError) -> SyncError {
        warn!("Mutation of {} in {} failed: {}", id, self.key, error);
        if self.rollback_on_error {
            self.store.rollback(&self.key, id);
        } else {
            // Stays visible until a newer server state confirms or
            // overrides it.
            self.store.release(&self.key, id);
        }
        self.transport.invalidate(self.key.kind());
        SyncError::Mutation {
            id: id.clone(),
            source: Box::new(error),
        }
    }

    async fn token(&self) -> SyncResult<String> {
        if !self.tokens.is_signed_in() {
            return Err(SyncError::Auth("not signed in".to_string()));
        }
        self.tokens
            .get_token()
            .await?
            .ok_or_else(|| SyncError::Auth("no access token".to_string()))
    }
}

impl Drop for ResourceHandle {
    fn drop(&mut self) {
        self.store.remove_listener(self.listener);
        self.transport.detach(&self.key);
        debug!("Detached {}", self.key);
    }
}

impl std::fmt::Debug for ResourceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("key", &self.key)
            .field("mode", &self.transport.mode())
            .finish()
    }
}

enum SortKey {
    Missing,
    Number(f64),
    Text(String),
    Time(DateTime<FixedOffset>),
}

impl SortKey {
    fn of(value: Option<&Value>) -> Self {
        match value {
            Some(Value::String(s)) => match DateTime::parse_from_rfc3339(s) {
                Ok(time) => SortKey::Time(time),
                Err(_) => SortKey::Text(s.clone()),
            },
            Some(Value::Number(n)) => n.as_f64().map_or(SortKey::Missing, SortKey::Number),
            _ => SortKey::Missing,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            SortKey::Missing => 0,
            SortKey::Number(_) => 1,
            SortKey::Text(_) => 2,
            SortKey::Time(_) => 3,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (SortKey::Time(a), SortKey::Time(b)) => a.cmp(b),
            (SortKey::Number(a), SortKey::Number(b)) => a.total_cmp(b),
            (SortKey::Text(a), SortKey::Text(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

// Missing sort values go last.
fn compare_newest_first(a: &Entity, b: &Entity, field: &str) -> Ordering {
    SortKey::of(b.get(field))
        .compare(&SortKey::of(a.get(field)))
        .then_with(|| a.id().cmp(b.id()))
}
