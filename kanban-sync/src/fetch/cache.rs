//! Keyed snapshot cache with stale-while-revalidate semantics.
//!
//! Concurrent loads of one key share a single request. A 429 response is
//! never retried: it starts a cool-down during which no request for the key
//! is sent, and it does not count as a failure.

use crate::api::ResourceApi;
use crate::auth::TokenProvider;
use crate::config::QueryPolicy;
use crate::error::{SyncError, SyncResult};
use crate::store::RevisionClock;
use crate::transport::EntityChange;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use kanban_sync_types::{Entity, ResourceKey, ResourceKind, ResourceState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Outcome of a cache load. Errors are shared between joined callers.
pub type FetchResult = Result<Arc<ResourceState>, Arc<SyncError>>;

type SharedFetch = Shared<BoxFuture<'static, FetchResult>>;

#[derive(Default)]
struct CacheEntry {
    state: Option<Arc<ResourceState>>,
    fetched_at: Option<Instant>,
    stale: bool,
    observers: usize,
    unobserved_since: Option<Instant>,
    in_flight: Option<SharedFetch>,
    /// Id of the most recently started load. Only that load writes its
    /// result back.
    fetch_id: Option<u64>,
    /// Server confirmations recorded while a load was in flight, replayed
    /// onto its result.
    confirmed: Vec<(u64, EntityChange)>,
    rate_limited_until: Option<Instant>,
    failure_count: u32,
    last_error: Option<Arc<SyncError>>,
    gc_task: Option<JoinHandle<()>>,
}

impl CacheEntry {
    fn fresh_state(&self, now: Instant, stale_time: Duration) -> Option<Arc<ResourceState>> {
        if self.stale {
            return None;
        }
        let fetched_at = self.fetched_at?;
        if now.duration_since(fetched_at) >= stale_time {
            return None;
        }
        self.state.clone()
    }

    fn cooling_down(&self, now: Instant) -> bool {
        self.rate_limited_until.is_some_and(|until| now < until)
    }
}

/// Snapshot cache shared by every fetch-mode feed.
pub struct QueryCache {
    api: Arc<dyn ResourceApi>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<RevisionClock>,
    policy: QueryPolicy,
    entries: Mutex<HashMap<ResourceKey, CacheEntry>>,
    next_fetch: AtomicU64,
}

impl QueryCache {
    pub fn new(
        api: Arc<dyn ResourceApi>,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<RevisionClock>,
        policy: QueryPolicy,
    ) -> Self {
        Self {
            api,
            tokens,
            clock,
            policy,
            entries: Mutex::new(HashMap::new()),
            next_fetch: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> &QueryPolicy {
        &self.policy
    }

    /// Returns cached data if fresh, otherwise loads it (joining any
    /// in-flight load).
    pub async fn fetch(self: &Arc<Self>, key: &ResourceKey) -> FetchResult {
        self.load(key, false).await
    }

    /// Loads regardless of freshness. Still joins an in-flight load and
    /// still honours a rate-limit cool-down.
    pub async fn refresh(self: &Arc<Self>, key: &ResourceKey) -> FetchResult {
        self.load(key, true).await
    }

    async fn load(self: &Arc<Self>, key: &ResourceKey, force: bool) -> FetchResult {
        let pending = {
            let now = Instant::now();
            let mut entries = self.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| CacheEntry {
                unobserved_since: Some(now),
                ..CacheEntry::default()
            });

            if let Some(pending) = &entry.in_flight {
                debug!("Joining in-flight fetch of {}", key);
                pending.clone()
            } else if let Some(state) = entry
                .fresh_state(now, self.policy.stale_time())
                .filter(|_| !force)
            {
                return Ok(state);
            } else if entry.cooling_down(now) {
                debug!("Skipping fetch of {} during rate-limit cool-down", key);
                return Err(entry.last_error.clone().unwrap_or_else(|| {
                    Arc::new(SyncError::RateLimited {
                        retry_after_secs: None,
                    })
                }));
            } else {
                let fetch_id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
                let pending = Arc::clone(self).start(key.clone(), fetch_id);
                entry.in_flight = Some(pending.clone());
                entry.fetch_id = Some(fetch_id);
                pending
            }
        };
        pending.await
    }

    fn start(self: Arc<Self>, key: ResourceKey, fetch_id: u64) -> SharedFetch {
        async move {
            // Stamped at dispatch: the response cannot reflect writes made
            // while it was in flight.
            let revision = self.clock.tick();
            let result = self.fetch_with_retry(&key).await;
            self.complete(&key, fetch_id, revision, result)
        }
        .boxed()
        .shared()
    }

    async fn fetch_with_retry(&self, key: &ResourceKey) -> SyncResult<Vec<Entity>> {
        let retry = &self.policy.retry;
        let mut attempt = 0;
        loop {
            match self.fetch_once(key).await {
                Ok(entities) => return Ok(entities),
                Err(error) if error.is_retryable() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    attempt += 1;
                    warn!(
                        "Fetch of {} failed ({}), retry {}/{} in {:?}",
                        key, error, attempt, retry.max_retries, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }

    async fn fetch_once(&self, key: &ResourceKey) -> SyncResult<Vec<Entity>> {
        if !self.tokens.is_signed_in() {
            return Err(SyncError::Auth("not signed in".to_string()));
        }
        let token = self
            .tokens
            .get_token()
            .await?
            .ok_or_else(|| SyncError::Auth("no access token".to_string()))?;
        debug!("Fetching {}", key);
        self.api.list(key, &token).await
    }

    fn complete(
        &self,
        key: &ResourceKey,
        fetch_id: u64,
        revision: u64,
        result: SyncResult<Vec<Entity>>,
    ) -> FetchResult {
        let now = Instant::now();
        let mut entries = self.lock();
        // Evicted or superseded while in flight: hand the result to the
        // callers still waiting, but leave the cache alone.
        let Some(entry) = entries
            .get_mut(key)
            .filter(|entry| entry.fetch_id == Some(fetch_id))
        else {
            debug!("Discarding result of abandoned fetch of {}", key);
            return result
                .map(|entities| Arc::new(ResourceState::from_entities(entities, revision)))
                .map_err(Arc::new);
        };
        entry.in_flight = None;
        let confirmed = std::mem::take(&mut entry.confirmed);

        match result {
            Ok(entities) => {
                let mut state = ResourceState::from_entities(entities, revision);
                let mut latest = revision;
                for (confirmed_at, change) in confirmed {
                    if confirmed_at > revision {
                        change.apply_to(&mut state);
                        latest = latest.max(confirmed_at);
                    }
                }
                state.set_revision(latest);

                let state = Arc::new(state);
                entry.state = Some(Arc::clone(&state));
                entry.fetched_at = Some(now);
                entry.stale = false;
                entry.failure_count = 0;
                entry.last_error = None;
                entry.rate_limited_until = None;
                debug!("Fetched {} ({} entities)", key, state.len());
                Ok(state)
            }
            Err(error) => {
                if error.is_rate_limited() {
                    let window = error
                        .retry_after()
                        .unwrap_or_else(|| self.policy.rate_limit_cooldown());
                    if !entry.cooling_down(now) {
                        warn!(
                            "Fetch of {} rate limited, pausing requests for {:?}",
                            key, window
                        );
                    }
                    entry.rate_limited_until = Some(now + window);
                } else {
                    entry.failure_count += 1;
                    warn!(
                        "Fetch of {} failed ({} consecutive): {}",
                        key, entry.failure_count, error
                    );
                }
                let error = Arc::new(error);
                entry.last_error = Some(Arc::clone(&error));
                Err(error)
            }
        }
    }

    /// Applies an unconfirmed local change to the cached copy, keeping its
    /// revision. Returns the new state if the key has data.
    pub fn patch_local(&self, key: &ResourceKey, change: &EntityChange) -> Option<Arc<ResourceState>> {
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        let mut state = ResourceState::clone(entry.state.as_deref()?);
        change.apply_to(&mut state);
        let state = Arc::new(state);
        entry.state = Some(Arc::clone(&state));
        Some(state)
    }

    /// Applies a server-confirmed change as a new publication.
    pub fn patch_server(&self, key: &ResourceKey, change: &EntityChange) -> Option<Arc<ResourceState>> {
        let revision = self.clock.tick();
        let mut entries = self.lock();
        let entry = entries.get_mut(key)?;
        if entry.in_flight.is_some() {
            entry.confirmed.push((revision, change.clone()));
        }
        let mut state = ResourceState::clone(entry.state.as_deref()?);
        change.apply_to(&mut state);
        state.set_revision(revision);
        let state = Arc::new(state);
        entry.state = Some(Arc::clone(&state));
        Some(state)
    }

    /// Marks every entry of `kind` stale and returns the observed keys,
    /// which are the ones that should refetch now.
    pub fn invalidate(&self, kind: ResourceKind) -> Vec<ResourceKey> {
        let mut entries = self.lock();
        let mut observed = Vec::new();
        for (key, entry) in entries.iter_mut().filter(|(key, _)| key.kind() == kind) {
            entry.stale = true;
            if entry.observers > 0 {
                observed.push(key.clone());
            }
        }
        debug!(
            "Invalidated {}: {} observed entries to refetch",
            kind,
            observed.len()
        );
        observed
    }

    /// Marks one entry stale. Returns whether it is observed.
    pub fn invalidate_key(&self, key: &ResourceKey) -> bool {
        let mut entries = self.lock();
        match entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                entry.observers > 0
            }
            None => false,
        }
    }

    pub fn observe(&self, key: &ResourceKey) {
        let mut entries = self.lock();
        let entry = entries.entry(key.clone()).or_default();
        entry.observers += 1;
        entry.unobserved_since = None;
        if let Some(task) = entry.gc_task.take() {
            task.abort();
        }
    }

    /// Drops one observer; the last one schedules eviction after `gc_time`.
    pub fn unobserve(self: &Arc<Self>, key: &ResourceKey) {
        let mut entries = self.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.observers = entry.observers.saturating_sub(1);
        if entry.observers > 0 {
            return;
        }
        entry.unobserved_since = Some(Instant::now());
        // The driver polling the load is gone; a later observer starts over.
        if entry.in_flight.take().is_some() {
            debug!("Abandoning in-flight fetch of {}", key);
        }

        // Outside a runtime the entry waits for an explicit sweep.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let cache = Arc::downgrade(self);
        let gc_time = self.policy.gc_time();
        let sweep = runtime.spawn(async move {
            tokio::time::sleep(gc_time).await;
            if let Some(cache) = cache.upgrade() {
                cache.collect_garbage();
            }
        });
        if let Some(previous) = entry.gc_task.replace(sweep) {
            previous.abort();
        }
    }

    /// Evicts entries unobserved for at least `gc_time`. Returns how many
    /// were evicted.
    pub fn collect_garbage(&self) -> usize {
        let now = Instant::now();
        let gc_time = self.policy.gc_time();
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|key, entry| {
            let expired = entry.observers == 0
                && entry
                    .unobserved_since
                    .is_some_and(|since| now.duration_since(since) >= gc_time);
            if expired {
                debug!("Evicting cached {}", key);
            }
            !expired
        });
        before - entries.len()
    }

    /// Cached data regardless of freshness.
    pub fn peek(&self, key: &ResourceKey) -> Option<Arc<ResourceState>> {
        self.lock().get(key).and_then(|e| e.state.clone())
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.lock().contains_key(key)
    }

    /// True when a fetch would hit the network (ignoring cool-downs).
    pub fn is_stale(&self, key: &ResourceKey) -> bool {
        let now = Instant::now();
        self.lock()
            .get(key)
            .and_then(|e| e.fresh_state(now, self.policy.stale_time()))
            .is_none()
    }

    pub fn observers(&self, key: &ResourceKey) -> usize {
        self.lock().get(key).map_or(0, |e| e.observers)
    }

    /// Consecutive non-rate-limit failures.
    pub fn failure_count(&self, key: &ResourceKey) -> u32 {
        self.lock().get(key).map_or(0, |e| e.failure_count)
    }

    pub fn last_error(&self, key: &ResourceKey) -> Option<Arc<SyncError>> {
        self.lock().get(key).and_then(|e| e.last_error.clone())
    }

    /// Time left in the rate-limit cool-down of `key`.
    pub fn cooldown_remaining(&self, key: &ResourceKey) -> Option<Duration> {
        let now = Instant::now();
        self.lock()
            .get(key)
            .and_then(|e| e.rate_limited_until)
            .filter(|until| *until > now)
            .map(|until| until - now)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ResourceKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("entries", &self.lock().len())
            .field("policy", &self.policy)
            .finish()
    }
}
