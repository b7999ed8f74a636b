//! Stream connections.
//!
//! The client only reads text frames, so a connection is a receive-only
//! channel of strings. [`WsConnector`] opens real WebSocket connections;
//! [`mock::MockConnector`] hands out in-process channels for tests.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

/// An open stream connection.
#[async_trait]
pub trait StreamConnection: Send {
    /// Returns the next text frame, an error, or `None` once the server has
    /// closed the connection.
    async fn recv(&mut self) -> Option<SyncResult<String>>;

    async fn close(&mut self) -> SyncResult<()>;
}

/// Opens stream connections.
#[async_trait]
pub trait StreamConnector: Send + Sync {
    async fn connect(&self, url: &str) -> SyncResult<Box<dyn StreamConnection>>;
}

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`StreamConnection`] over tokio-tungstenite.
pub struct WsConnection {
    ws: WsStream,
}

#[async_trait]
impl StreamConnection for WsConnection {
    async fn recv(&mut self) -> Option<SyncResult<String>> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => {
                    return Some(String::from_utf8(data.to_vec()).map_err(|e| {
                        SyncError::Protocol(format!("binary frame is not UTF-8: {e}"))
                    }));
                }
                Some(Ok(Message::Close(_))) | None => return None,
                // Pings are answered by tungstenite itself.
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(SyncError::Transport(e.to_string()))),
            }
        }
    }

    async fn close(&mut self) -> SyncResult<()> {
        self.ws
            .close(None)
            .await
            .map_err(|e| SyncError::Transport(e.to_string()))
    }
}

/// Connects over WebSocket (`ws://` or `wss://`).
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl StreamConnector for WsConnector {
    async fn connect(&self, url: &str) -> SyncResult<Box<dyn StreamConnection>> {
        let (ws, response) = connect_async(url)
            .await
            .map_err(|e| SyncError::Transport(format!("connect failed: {e}")))?;
        debug!("WebSocket upgrade status {}", response.status());
        Ok(Box::new(WsConnection { ws }))
    }
}

/// An in-process connector for testing.
pub mod mock {
    use super::*;
    use serde_json::Value;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex, MutexGuard};
    use tokio::sync::{Notify, mpsc};

    enum Frame {
        Text(String),
        Error(String),
    }

    /// Server side of one accepted mock connection.
    #[derive(Clone)]
    pub struct MockSession {
        url: String,
        tx: Arc<Mutex<Option<mpsc::UnboundedSender<Frame>>>>,
    }

    impl MockSession {
        /// The URL the client connected to.
        pub fn url(&self) -> &str {
            &self.url
        }

        pub fn send_text(&self, text: impl Into<String>) -> bool {
            self.send(Frame::Text(text.into()))
        }

        pub fn send_json(&self, value: &Value) -> bool {
            self.send_text(value.to_string())
        }

        /// Delivers a transport error to the client.
        pub fn fail(&self, reason: impl Into<String>) -> bool {
            self.send(Frame::Error(reason.into()))
        }

        /// Closes the connection from the server side.
        pub fn close(&self) {
            self.lock().take();
        }

        /// Whether both sides still hold the connection.
        pub fn is_open(&self) -> bool {
            self.lock().as_ref().is_some_and(|tx| !tx.is_closed())
        }

        fn send(&self, frame: Frame) -> bool {
            self.lock().as_ref().is_some_and(|tx| tx.send(frame).is_ok())
        }

        fn lock(&self) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Frame>>> {
            self.tx.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    struct MockConnection {
        // `None` once the client closed it.
        rx: Option<mpsc::UnboundedReceiver<Frame>>,
    }

    #[async_trait]
    impl StreamConnection for MockConnection {
        async fn recv(&mut self) -> Option<SyncResult<String>> {
            let rx = self.rx.as_mut()?;
            match rx.recv().await {
                Some(Frame::Text(text)) => Some(Ok(text)),
                Some(Frame::Error(reason)) => Some(Err(SyncError::Transport(reason))),
                None => None,
            }
        }

        async fn close(&mut self) -> SyncResult<()> {
            self.rx = None;
            Ok(())
        }
    }

    #[derive(Default)]
    struct Inner {
        sessions: Vec<MockSession>,
        refusals: VecDeque<String>,
        attempts: usize,
    }

    /// Accepts every connection unless a refusal is queued.
    #[derive(Clone, Default)]
    pub struct MockConnector {
        inner: Arc<Mutex<Inner>>,
        accepted: Arc<Notify>,
    }

    impl MockConnector {
        pub fn new() -> Self {
            Self::default()
        }

        /// Makes the next connection attempt fail.
        pub fn refuse_next(&self, reason: impl Into<String>) {
            self.lock().refusals.push_back(reason.into());
        }

        /// Connection attempts so far, refused ones included.
        pub fn attempts(&self) -> usize {
            self.lock().attempts
        }

        /// Accepted connections so far.
        pub fn connections(&self) -> usize {
            self.lock().sessions.len()
        }

        pub fn session(&self, index: usize) -> Option<MockSession> {
            self.lock().sessions.get(index).cloned()
        }

        /// Waits until connection `index` has been accepted.
        pub async fn wait_for_session(&self, index: usize) -> MockSession {
            loop {
                let accepted = self.accepted.notified();
                if let Some(session) = self.session(index) {
                    return session;
                }
                accepted.await;
            }
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }
    }

    #[async_trait]
    impl StreamConnector for MockConnector {
        async fn connect(&self, url: &str) -> SyncResult<Box<dyn StreamConnection>> {
            let mut inner = self.lock();
            inner.attempts += 1;
            if let Some(reason) = inner.refusals.pop_front() {
                return Err(SyncError::Transport(reason));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            inner.sessions.push(MockSession {
                url: url.to_string(),
                tx: Arc::new(Mutex::new(Some(tx))),
            });
            drop(inner);
            self.accepted.notify_waiters();
            Ok(Box::new(MockConnection { rx: Some(rx) }))
        }
    }
}
