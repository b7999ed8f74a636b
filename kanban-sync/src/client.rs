//! The sync service shared by every consumer in the process.

use crate::api::{HttpApi, ResourceApi};
use crate::auth::{StaticTokenProvider, TokenProvider};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::fetch::{FetchTransport, QueryCache};
use crate::resource::ResourceHandle;
use crate::store::{OptimisticStore, RevisionClock};
use crate::stream::{StreamConnector, StreamPhase, StreamTransport, WsConnector};
use crate::transport::{Transport, TransportMode, TransportSelector};
use kanban_sync_types::{ResourceKey, ResourceKind};
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point of the sync layer.
///
/// Owns the optimistic store and both transports. Construct one per
/// process and share it; clones are cheap and refer to the same service.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: SyncConfig,
    selector: TransportSelector,
    store: Arc<OptimisticStore>,
    api: Arc<dyn ResourceApi>,
    tokens: Arc<dyn TokenProvider>,
    stream: Arc<StreamTransport>,
    fetch: Arc<FetchTransport>,
}

impl SyncClient {
    /// Creates a client talking HTTP and WebSocket to the configured
    /// endpoints.
    pub fn new(config: SyncConfig, tokens: Arc<dyn TokenProvider>) -> SyncResult<Self> {
        SyncClientBuilder::new(config).tokens(tokens).build()
    }

    pub fn builder(config: SyncConfig) -> SyncClientBuilder {
        SyncClientBuilder::new(config)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<OptimisticStore> {
        &self.inner.store
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        self.inner.fetch.cache()
    }

    pub fn mode(&self, kind: ResourceKind) -> TransportMode {
        self.inner.selector.mode(kind)
    }

    /// Phase of the stream feed for `key`, if `key` is streamed and was
    /// ever attached.
    pub fn stream_phase(&self, key: &ResourceKey) -> Option<StreamPhase> {
        self.inner.stream.phase(key)
    }

    /// Attaches to `key`. Must be called from within a Tokio runtime.
    pub fn resource(&self, key: ResourceKey) -> ResourceHandle {
        ResourceHandle::attach(
            key.clone(),
            self.transport(key.kind()),
            Arc::clone(&self.inner.store),
            Arc::clone(&self.inner.api),
            Arc::clone(&self.inner.tokens),
            self.inner.config.rollback_on_error,
        )
    }

    /// Marks every cached key of `kind` stale; observed keys refetch.
    pub fn invalidate(&self, kind: ResourceKind) {
        debug!("Invalidating {}", kind);
        self.transport(kind).invalidate(kind);
    }

    /// The signed-in user or token changed: streams resync with the new
    /// token and fetched data is reloaded.
    pub fn notify_auth_changed(&self) {
        info!("Auth changed, resyncing feeds");
        self.inner.stream.on_auth_changed();
        self.inner.fetch.on_auth_changed();
    }

    pub fn on_window_focus(&self) {
        self.inner.stream.on_window_focus();
        self.inner.fetch.on_window_focus();
    }

    pub fn on_network_reconnect(&self) {
        self.inner.stream.on_network_reconnect();
        self.inner.fetch.on_network_reconnect();
    }

    fn transport(&self, kind: ResourceKind) -> Arc<dyn Transport> {
        match self.inner.selector.mode(kind) {
            TransportMode::Stream => Arc::clone(&self.inner.stream) as Arc<dyn Transport>,
            TransportMode::Fetch => Arc::clone(&self.inner.fetch) as Arc<dyn Transport>,
        }
    }
}

impl std::fmt::Debug for SyncClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncClient")
            .field("remote", &self.inner.selector.is_remote())
            .field("rest_base_url", &self.inner.config.rest_base_url())
            .finish()
    }
}

/// Builder for [`SyncClient`] with injectable collaborators.
pub struct SyncClientBuilder {
    config: SyncConfig,
    tokens: Option<Arc<dyn TokenProvider>>,
    api: Option<Arc<dyn ResourceApi>>,
    connector: Option<Arc<dyn StreamConnector>>,
}

impl SyncClientBuilder {
    pub fn new(config: SyncConfig) -> Self {
        Self {
            config,
            tokens: None,
            api: None,
            connector: None,
        }
    }

    pub fn tokens(mut self, tokens: Arc<dyn TokenProvider>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Replaces the HTTP API client.
    pub fn api(mut self, api: Arc<dyn ResourceApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Replaces the WebSocket connector.
    pub fn connector(mut self, connector: Arc<dyn StreamConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn build(self) -> SyncResult<SyncClient> {
        let config = self.config;
        let tokens: Arc<dyn TokenProvider> = match self.tokens {
            Some(tokens) => tokens,
            None => Arc::new(StaticTokenProvider::signed_out()),
        };
        let api: Arc<dyn ResourceApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpApi::new(
                config.rest_base_url(),
                config.request_timeout(),
            )?),
        };
        let connector: Arc<dyn StreamConnector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WsConnector),
        };

        let clock = Arc::new(RevisionClock::new());
        let store = Arc::new(OptimisticStore::with_clock(Arc::clone(&clock)));
        let selector = TransportSelector::new(&config);

        let stream = Arc::new(StreamTransport::new(
            connector,
            Arc::clone(&tokens),
            Arc::clone(&clock),
            config.ws_base_url.clone(),
            config.reconnect.clone(),
        ));
        let cache = Arc::new(QueryCache::new(
            Arc::clone(&api),
            Arc::clone(&tokens),
            clock,
            config.query.clone(),
        ));
        let fetch = Arc::new(FetchTransport::new(cache));

        info!(
            "Sync client ready (projects over {}, REST at {})",
            selector.mode(ResourceKind::Projects),
            config.rest_base_url()
        );

        Ok(SyncClient {
            inner: Arc::new(ClientInner {
                config,
                selector,
                store,
                api,
                tokens,
                stream,
                fetch,
            }),
        })
    }
}
