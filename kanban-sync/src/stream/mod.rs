//! Patch stream client.
//!
//! One driver task per attached key walks the phases
//! `Connecting → Streaming → (Reconnecting | Closed)`. Every connection
//! starts from a full snapshot, so a reconnect is always a full resync; a
//! patch that fails to apply is treated like a dropped connection.
//!
//! While reconnecting the last good state stays published with
//! `connected = false`.

mod connector;
mod message;
mod patch;

pub use connector::{StreamConnection, StreamConnector, WsConnection, WsConnector, mock};
pub use message::{StreamDocument, StreamMessage};
pub use patch::{apply_operation, apply_patch, parse_pointer};

use crate::api::paths;
use crate::auth::TokenProvider;
use crate::config::ReconnectPolicy;
use crate::error::{SyncError, SyncResult};
use crate::feed::{FeedHandles, FeedRegistry};
use crate::store::RevisionClock;
use crate::transport::{EntityChange, FeedState, Transport, TransportMode};
use kanban_sync_types::{ResourceKey, ResourceKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Connection phase of one stream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    Connecting,
    Streaming,
    Reconnecting,
    Closed,
}

/// [`Transport`] that keeps one live patch stream per attached key.
pub struct StreamTransport {
    shared: Arc<StreamShared>,
    feeds: FeedRegistry,
}

struct StreamShared {
    connector: Arc<dyn StreamConnector>,
    tokens: Arc<dyn TokenProvider>,
    clock: Arc<RevisionClock>,
    ws_base_url: String,
    policy: ReconnectPolicy,
    phases: Mutex<HashMap<ResourceKey, StreamPhase>>,
}

impl StreamShared {
    fn url_for(&self, key: &ResourceKey, token: &str) -> SyncResult<String> {
        let path = paths::stream(key, token)
            .ok_or_else(|| SyncError::Config(format!("{} cannot be streamed", key.kind())))?;
        Ok(format!("{}{}", self.ws_base_url, path))
    }

    fn set_phase(&self, key: &ResourceKey, phase: StreamPhase) {
        let previous = self.lock_phases().insert(key.clone(), phase);
        if previous != Some(phase) {
            debug!("Stream {} -> {:?}", key, phase);
        }
    }

    fn lock_phases(&self) -> MutexGuard<'_, HashMap<ResourceKey, StreamPhase>> {
        self.phases.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl StreamTransport {
    pub fn new(
        connector: Arc<dyn StreamConnector>,
        tokens: Arc<dyn TokenProvider>,
        clock: Arc<RevisionClock>,
        ws_base_url: impl Into<String>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            shared: Arc::new(StreamShared {
                connector,
                tokens,
                clock,
                ws_base_url: ws_base_url.into().trim_end_matches('/').to_string(),
                policy,
                phases: Mutex::new(HashMap::new()),
            }),
            feeds: FeedRegistry::new(),
        }
    }

    /// Current phase of the feed for `key`, if it was ever attached.
    pub fn phase(&self, key: &ResourceKey) -> Option<StreamPhase> {
        self.shared.lock_phases().get(key).copied()
    }

    /// Stream URL for `key` with `token`.
    pub fn url_for(&self, key: &ResourceKey, token: &str) -> SyncResult<String> {
        self.shared.url_for(key, token)
    }

    /// Number of live attachments for `key`.
    pub fn observers(&self, key: &ResourceKey) -> usize {
        self.feeds.refs(key)
    }

    fn spawn(shared: &Arc<StreamShared>, handles: FeedHandles) -> JoinHandle<()> {
        let driver = StreamDriver {
            shared: Arc::clone(shared),
            handles,
        };
        tokio::spawn(driver.run())
    }
}

impl Transport for StreamTransport {
    fn mode(&self) -> TransportMode {
        TransportMode::Stream
    }

    fn attach(&self, key: &ResourceKey) -> watch::Receiver<FeedState> {
        self.feeds
            .attach(key, |handles| Self::spawn(&self.shared, handles))
    }

    fn detach(&self, key: &ResourceKey) {
        if self.feeds.detach(key) {
            self.shared.set_phase(key, StreamPhase::Closed);
        }
    }

    // The stream is the only writer of server state; local writes live in
    // the optimistic store until a patch confirms them.
    fn apply_local(&self, _key: &ResourceKey, _change: &EntityChange) {}

    fn confirm(&self, _key: &ResourceKey, _change: &EntityChange) {}

    fn invalidate(&self, kind: ResourceKind) {
        debug!("Ignoring invalidation of streamed {}", kind);
    }

    fn refetch(&self, key: &ResourceKey) {
        self.feeds.wake(key);
    }

    fn on_auth_changed(&self) {
        self.feeds
            .wake_or_restart(|handles| Self::spawn(&self.shared, handles));
    }

    fn on_window_focus(&self) {}

    fn on_network_reconnect(&self) {
        for key in self.feeds.keys() {
            if self.phase(&key) == Some(StreamPhase::Reconnecting) {
                self.feeds.wake(&key);
            }
        }
    }
}

enum SessionEnd {
    /// The server signalled a clean end of stream.
    Finished,
    /// Reconnecting cannot help.
    Fatal(SyncError),
    /// A resync was requested.
    Resync,
    Dropped {
        error: Option<SyncError>,
        /// Whether the session got as far as a snapshot.
        streamed: bool,
    },
}

struct StreamDriver {
    shared: Arc<StreamShared>,
    handles: FeedHandles,
}

impl StreamDriver {
    async fn run(self) {
        let key = self.handles.key.clone();
        let policy = self.shared.policy.clone();
        let mut attempt: u32 = 0;

        loop {
            self.shared.set_phase(&key, StreamPhase::Connecting);
            match self.session().await {
                SessionEnd::Finished => {
                    info!("Stream for {} finished", key);
                    self.handles.publish(|feed| feed.connected = false);
                    break;
                }
                SessionEnd::Fatal(error) => {
                    warn!("Stream for {} closed: {}", key, error);
                    self.handles.publish(|feed| {
                        feed.connected = false;
                        feed.error = Some(Arc::new(error));
                    });
                    break;
                }
                SessionEnd::Resync => {
                    attempt = 0;
                    self.shared.set_phase(&key, StreamPhase::Reconnecting);
                }
                SessionEnd::Dropped { error, streamed } => {
                    if streamed {
                        attempt = 0;
                    }
                    self.handles.publish(|feed| {
                        feed.connected = false;
                        if let Some(error) = error {
                            feed.error = Some(Arc::new(error));
                        }
                    });
                    if policy.max_attempts.is_some_and(|max| attempt >= max) {
                        warn!(
                            "Stream for {} closed after {} reconnect attempts",
                            key, attempt
                        );
                        break;
                    }

                    let delay = policy.delay_for(attempt);
                    attempt += 1;
                    self.shared.set_phase(&key, StreamPhase::Reconnecting);
                    debug!("Reconnecting {} in {:?}", key, delay);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.handles.wake.notified() => {}
                    }
                }
            }
        }

        self.shared.set_phase(&key, StreamPhase::Closed);
    }

    async fn session(&self) -> SessionEnd {
        let key = &self.handles.key;

        if !self.shared.tokens.is_signed_in() {
            return SessionEnd::Fatal(SyncError::Auth("not signed in".to_string()));
        }
        let token = match self.shared.tokens.get_token().await {
            Ok(Some(token)) => token,
            Ok(None) => {
                return SessionEnd::Fatal(SyncError::Auth("no access token".to_string()));
            }
            Err(error) => {
                return SessionEnd::Dropped {
                    error: Some(error),
                    streamed: false,
                };
            }
        };
        let url = match self.shared.url_for(key, &token) {
            Ok(url) => url,
            Err(error) => return SessionEnd::Fatal(error),
        };

        let mut conn = match self.shared.connector.connect(&url).await {
            Ok(conn) => conn,
            Err(error) => {
                warn!("Stream connect for {} failed: {}", key, error);
                return SessionEnd::Dropped {
                    error: Some(error),
                    streamed: false,
                };
            }
        };
        info!("Stream connected for {}", key);

        let mut document: Option<StreamDocument> = None;
        loop {
            let frame = tokio::select! {
                frame = conn.recv() => Some(frame),
                _ = self.handles.wake.notified() => None,
            };
            let streamed = document.is_some();

            let text = match frame {
                None => {
                    let _ = conn.close().await;
                    return SessionEnd::Resync;
                }
                Some(Some(Ok(text))) => text,
                Some(Some(Err(error))) => {
                    warn!("Stream for {} errored: {}", key, error);
                    return SessionEnd::Dropped {
                        error: Some(error),
                        streamed,
                    };
                }
                Some(None) => {
                    info!("Stream for {} closed by server", key);
                    return SessionEnd::Dropped {
                        error: None,
                        streamed,
                    };
                }
            };

            match self.handle(&mut document, &text) {
                Ok(true) => {}
                Ok(false) => {
                    let _ = conn.close().await;
                    return SessionEnd::Finished;
                }
                Err(error) => {
                    warn!("Stream for {} needs resync: {}", key, error);
                    let _ = conn.close().await;
                    return SessionEnd::Dropped {
                        error: Some(error),
                        streamed,
                    };
                }
            }
        }
    }

    /// Applies one message. Returns false at end of stream.
    fn handle(&self, document: &mut Option<StreamDocument>, text: &str) -> SyncResult<bool> {
        let kind = self.handles.key.kind();
        let message = StreamMessage::decode(text)?;
        let root_replacement = message.is_root_replacement();

        match message {
            StreamMessage::Finished => return Ok(false),
            StreamMessage::Snapshot(value) => {
                let revision = self.shared.clock.tick();
                *document = Some(StreamDocument::from_snapshot(kind, value, revision)?);
            }
            StreamMessage::Patch(ops) => {
                if document.is_none() {
                    if !root_replacement {
                        return Err(SyncError::Protocol(
                            "patch received before snapshot".to_string(),
                        ));
                    }
                    *document = Some(StreamDocument::empty(kind));
                }
                let revision = self.shared.clock.tick();
                if let Some(doc) = document.as_mut() {
                    doc.apply(&ops, revision)?;
                }
            }
        }

        if let Some(doc) = document.as_ref() {
            let state = Arc::new(doc.state().clone());
            self.handles.publish(move |feed| {
                feed.state = Some(state);
                feed.connected = true;
                feed.error = None;
            });
            self.shared
                .set_phase(&self.handles.key, StreamPhase::Streaming);
        }
        Ok(true)
    }
}
