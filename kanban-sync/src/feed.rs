//! Reference-counted registry of per-key feeds.
//!
//! Every attached key owns a watch channel and one driver task. Attaching a
//! key that already has a feed joins it; the driver is aborted when the last
//! attachment is released.

use crate::transport::FeedState;
use kanban_sync_types::ResourceKey;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::debug;

/// What a driver task gets to work with.
#[derive(Clone)]
pub(crate) struct FeedHandles {
    pub key: ResourceKey,
    pub tx: Arc<watch::Sender<FeedState>>,
    /// Nudges the driver; the meaning depends on the transport.
    pub wake: Arc<Notify>,
}

impl FeedHandles {
    pub fn publish(&self, update: impl FnOnce(&mut FeedState)) {
        self.tx.send_modify(update);
    }
}

struct Feed {
    handles: FeedHandles,
    refs: usize,
    driver: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct FeedRegistry {
    feeds: Mutex<HashMap<ResourceKey, Feed>>,
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the feed for `key`, spawning its driver with `spawn` if this is
    /// the first attachment.
    pub fn attach<F>(&self, key: &ResourceKey, spawn: F) -> watch::Receiver<FeedState>
    where
        F: FnOnce(FeedHandles) -> JoinHandle<()>,
    {
        let mut feeds = self.lock();
        if let Some(feed) = feeds.get_mut(key) {
            feed.refs += 1;
            return feed.handles.tx.subscribe();
        }

        let (tx, rx) = watch::channel(FeedState::default());
        let handles = FeedHandles {
            key: key.clone(),
            tx: Arc::new(tx),
            wake: Arc::new(Notify::new()),
        };
        let driver = spawn(handles.clone());
        debug!("Started feed for {}", key);
        feeds.insert(
            key.clone(),
            Feed {
                handles,
                refs: 1,
                driver,
            },
        );
        rx
    }

    /// Releases one attachment. Returns true when it was the last one and
    /// the feed was stopped.
    pub fn detach(&self, key: &ResourceKey) -> bool {
        let mut feeds = self.lock();
        let Some(feed) = feeds.get_mut(key) else {
            return false;
        };
        feed.refs = feed.refs.saturating_sub(1);
        if feed.refs > 0 {
            return false;
        }
        if let Some(feed) = feeds.remove(key) {
            feed.driver.abort();
            debug!("Stopped feed for {}", key);
        }
        true
    }

    pub fn wake(&self, key: &ResourceKey) {
        if let Some(feed) = self.lock().get(key) {
            feed.handles.wake.notify_one();
        }
    }

    pub fn handles(&self, key: &ResourceKey) -> Option<FeedHandles> {
        self.lock().get(key).map(|f| f.handles.clone())
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.lock().keys().cloned().collect()
    }

    pub fn refs(&self, key: &ResourceKey) -> usize {
        self.lock().get(key).map_or(0, |f| f.refs)
    }

    /// Wakes every running driver and restarts the ones that have exited.
    pub fn wake_or_restart<F>(&self, mut spawn: F)
    where
        F: FnMut(FeedHandles) -> JoinHandle<()>,
    {
        for feed in self.lock().values_mut() {
            if feed.driver.is_finished() {
                debug!("Restarting feed for {}", feed.handles.key);
                feed.driver = spawn(feed.handles.clone());
            } else {
                feed.handles.wake.notify_one();
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, Feed>> {
        self.feeds.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for FeedRegistry {
    fn drop(&mut self) {
        for feed in self.lock().values() {
            feed.driver.abort();
        }
    }
}
