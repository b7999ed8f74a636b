//! Snapshot fetch client.
//!
//! Polls REST list endpoints through the [`QueryCache`]. Each attached key
//! gets a driver task that loads on attach, reloads when woken by an
//! invalidation and, if configured, on a fixed interval.

mod cache;

pub use cache::{FetchResult, QueryCache};

use crate::feed::{FeedHandles, FeedRegistry};
use crate::transport::{EntityChange, FeedState, Transport, TransportMode};
use kanban_sync_types::{ResourceKey, ResourceKind, ResourceState};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// [`Transport`] backed by polled snapshots.
pub struct FetchTransport {
    cache: Arc<QueryCache>,
    feeds: FeedRegistry,
}

impl FetchTransport {
    pub fn new(cache: Arc<QueryCache>) -> Self {
        Self {
            cache,
            feeds: FeedRegistry::new(),
        }
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    fn spawn(cache: &Arc<QueryCache>, handles: FeedHandles) -> JoinHandle<()> {
        let driver = FetchDriver {
            cache: Arc::clone(cache),
            handles,
        };
        tokio::spawn(driver.run())
    }

    fn publish_state(&self, key: &ResourceKey, state: Option<Arc<ResourceState>>) {
        if let (Some(state), Some(handles)) = (state, self.feeds.handles(key)) {
            handles.publish(|feed| feed.state = Some(state));
        }
    }

    fn wake_stale(&self) {
        for key in self.feeds.keys() {
            if self.cache.is_stale(&key) {
                self.feeds.wake(&key);
            }
        }
    }
}

impl Transport for FetchTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Fetch
    }

    fn attach(&self, key: &ResourceKey) -> watch::Receiver<FeedState> {
        self.cache.observe(key);
        self.feeds
            .attach(key, |handles| Self::spawn(&self.cache, handles))
    }

    fn detach(&self, key: &ResourceKey) {
        self.feeds.detach(key);
        self.cache.unobserve(key);
    }

    fn apply_local(&self, key: &ResourceKey, change: &EntityChange) {
        let state = self.cache.patch_local(key, change);
        self.publish_state(key, state);
    }

    fn confirm(&self, key: &ResourceKey, change: &EntityChange) {
        let state = self.cache.patch_server(key, change);
        self.publish_state(key, state);
    }

    fn invalidate(&self, kind: ResourceKind) {
        for key in self.cache.invalidate(kind) {
            self.feeds.wake(&key);
        }
    }

    fn refetch(&self, key: &ResourceKey) {
        if self.cache.invalidate_key(key) {
            self.feeds.wake(key);
        }
    }

    fn on_auth_changed(&self) {
        for key in self.feeds.keys() {
            self.cache.invalidate_key(&key);
        }
        self.feeds
            .wake_or_restart(|handles| Self::spawn(&self.cache, handles));
    }

    fn on_window_focus(&self) {
        if self.cache.policy().refetch_on_window_focus {
            debug!("Window focused, refetching stale feeds");
            self.wake_stale();
        }
    }

    fn on_network_reconnect(&self) {
        if self.cache.policy().refetch_on_reconnect {
            debug!("Network back, refetching stale feeds");
            self.wake_stale();
        }
    }
}

struct FetchDriver {
    cache: Arc<QueryCache>,
    handles: FeedHandles,
}

impl FetchDriver {
    async fn run(self) {
        let key = self.handles.key.clone();
        let interval = self.cache.policy().refetch_interval();

        // Serve what is cached while revalidating.
        if let Some(state) = self.cache.peek(&key) {
            self.handles.publish(|feed| feed.state = Some(state));
        }

        let mut force = false;
        loop {
            let result = if force {
                self.cache.refresh(&key).await
            } else {
                self.cache.fetch(&key).await
            };
            self.publish(result);

            force = match interval {
                Some(every) => tokio::select! {
                    _ = tokio::time::sleep(every) => true,
                    _ = self.handles.wake.notified() => false,
                },
                None => {
                    self.handles.wake.notified().await;
                    false
                }
            };
        }
    }

    fn publish(&self, result: FetchResult) {
        self.handles.publish(|feed| match result {
            Ok(state) => {
                feed.state = Some(state);
                feed.connected = true;
                feed.error = None;
            }
            Err(error) => {
                feed.connected = false;
                feed.error = Some(error);
            }
        });
    }
}
