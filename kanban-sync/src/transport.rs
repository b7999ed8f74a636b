//! Transport layer abstraction.
//!
//! A transport keeps one server-state feed per attached resource key and
//! publishes it through a [`watch`] channel. Two transports exist: the patch
//! stream (push) and the snapshot fetch cache (poll). The
//! [`TransportSelector`] decides once, from configuration, which one serves
//! each resource kind.

use crate::config::SyncConfig;
use crate::error::SyncError;
use kanban_sync_types::{Entity, EntityId, ResourceKey, ResourceKind, ResourceState};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// How a resource kind reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    /// Long-lived patch stream.
    Stream,
    /// Polled REST snapshots.
    Fetch,
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMode::Stream => write!(f, "stream"),
            TransportMode::Fetch => write!(f, "fetch"),
        }
    }
}

/// Chooses the transport mode per resource kind.
///
/// The choice is made at construction and never changes for the lifetime
/// of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportSelector {
    remote: bool,
}

impl TransportSelector {
    pub fn new(config: &SyncConfig) -> Self {
        Self {
            remote: config.is_remote(),
        }
    }

    /// A remote API deployment polls everything. Otherwise kinds the backend
    /// can stream are streamed.
    pub fn mode(&self, kind: ResourceKind) -> TransportMode {
        if !self.remote && kind.supports_streaming() {
            TransportMode::Stream
        } else {
            TransportMode::Fetch
        }
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }
}

/// Latest published server state of one resource key.
#[derive(Debug, Clone, Default)]
pub struct FeedState {
    /// `None` until the first snapshot arrives.
    pub state: Option<Arc<ResourceState>>,
    /// Whether the transport currently has a live view of the server.
    pub connected: bool,
    /// Last transport error, cleared by the next successful publication.
    pub error: Option<Arc<SyncError>>,
}

impl FeedState {
    pub fn is_loading(&self) -> bool {
        self.state.is_none()
    }
}

/// A single-entity change, local or confirmed by the server.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityChange {
    Upsert(Entity),
    Remove(EntityId),
}

impl EntityChange {
    pub fn id(&self) -> &EntityId {
        match self {
            EntityChange::Upsert(entity) => entity.id(),
            EntityChange::Remove(id) => id,
        }
    }

    /// Applies the change to a server state copy.
    pub fn apply_to(&self, state: &mut ResourceState) {
        match self {
            EntityChange::Upsert(entity) => {
                state.insert(entity.clone());
            }
            EntityChange::Remove(id) => {
                state.remove(id);
            }
        }
    }
}

/// A source of server state for resource keys.
///
/// Methods are synchronous; transports run their network work on spawned
/// tasks and must be used from within a Tokio runtime.
pub trait Transport: Send + Sync {
    fn mode(&self) -> TransportMode;

    /// Starts (or joins) the feed for `key`. Each call must be paired with
    /// one [`detach`](Transport::detach).
    fn attach(&self, key: &ResourceKey) -> watch::Receiver<FeedState>;

    /// Releases one attachment. The last release stops the feed.
    fn detach(&self, key: &ResourceKey);

    /// Reflects an optimistic write in transport-held state.
    fn apply_local(&self, key: &ResourceKey, change: &EntityChange);

    /// Records the server's answer to a successful mutation.
    fn confirm(&self, key: &ResourceKey, change: &EntityChange);

    /// Marks every key of `kind` stale. Observed keys refetch; unobserved
    /// keys wait for their next observer.
    fn invalidate(&self, kind: ResourceKind);

    /// Forces a fresh server view of `key`.
    fn refetch(&self, key: &ResourceKey);

    /// The signed-in user or their token changed.
    fn on_auth_changed(&self);

    fn on_window_focus(&self);

    fn on_network_reconnect(&self);
}
