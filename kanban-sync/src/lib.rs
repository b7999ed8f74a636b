//! Real-time sync layer for kanban resources.
//!
//! Keeps a client-side view of projects and issues consistent with the
//! backend while letting the user edit optimistically.
//!
//! # Architecture
//!
//! Server state reaches the client over one of two transports, picked once
//! per resource kind by the [`TransportSelector`]:
//!
//! - **Stream**: a long-lived connection delivering an initial snapshot and
//!   then ordered JSON-Patch batches.
//! - **Fetch**: polled REST snapshots held in a [`QueryCache`] with
//!   freshness, retry and rate-limit handling.
//!
//! Local writes go to the [`OptimisticStore`] first and show up at once.
//! The [`Reconciler`] merges them with the latest server state on every
//! read and drops the ones the server has confirmed.
//!
//! ## Components
//!
//! - **Store**: optimistic entries per resource key, with change listeners
//! - **Transport**: the feed abstraction and mode selection
//! - **Stream / Fetch**: the two transports
//! - **Reconcile**: merging and confirmation
//! - **Resource**: the per-key handle consumers hold
//! - **Client**: the service wiring it all together
//!
//! # Example
//!
//! ```no_run
//! use kanban_sync::{ResourceKey, StaticTokenProvider, SyncClient, SyncConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> kanban_sync::SyncResult<()> {
//! let tokens = Arc::new(StaticTokenProvider::new("token"));
//! let client = SyncClient::new(SyncConfig::default(), tokens)?;
//!
//! let mut projects = client.resource(ResourceKey::projects(Some("ws-1")));
//! let view = projects.wait_for(|view| !view.is_loading).await?;
//! for project in &view.items {
//!     println!("{}", project.id());
//! }
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod auth;
mod client;
pub mod config;
mod error;
mod feed;
pub mod fetch;
pub mod reconcile;
mod resource;
pub mod store;
pub mod stream;
pub mod transport;

pub use api::{HttpApi, ResourceApi};
pub use auth::{StaticTokenProvider, TokenProvider};
pub use client::{SyncClient, SyncClientBuilder};
pub use config::{QueryPolicy, ReconnectPolicy, RetryPolicy, SyncConfig};
pub use error::{SyncError, SyncResult};
pub use fetch::{FetchResult, FetchTransport, QueryCache};
pub use reconcile::{Merge, MergedState, Reconciler};
pub use resource::{ResourceHandle, ResourceView};
pub use store::{
    ChangeKind, ListenerId, OptimisticEntry, OptimisticSnapshot, OptimisticStore,
    OptimisticWrite, RevisionClock, StoreChange,
};
pub use stream::{StreamConnection, StreamConnector, StreamPhase, StreamTransport, WsConnector};
pub use transport::{EntityChange, FeedState, Transport, TransportMode, TransportSelector};

pub use kanban_sync_types::{
    Entity, EntityId, PatchOp, PatchOperation, ResourceKey, ResourceKind, ResourceState,
};
