//! Access-token source for REST calls and stream connections.

use crate::error::SyncResult;
use async_trait::async_trait;
use std::sync::RwLock;

/// Supplies bearer tokens for the signed-in user.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns a fresh access token, or `None` when no session exists.
    async fn get_token(&self) -> SyncResult<Option<String>>;

    fn is_signed_in(&self) -> bool;
}

/// A token provider holding a single token set by the caller.
#[derive(Debug, Default)]
pub struct StaticTokenProvider {
    token: RwLock<Option<String>>,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: RwLock::new(Some(token.into())),
        }
    }

    pub fn signed_out() -> Self {
        Self::default()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = Some(token.into());
    }

    pub fn sign_out(&self) {
        *self.token.write().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> SyncResult<Option<String>> {
        Ok(self.token.read().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn is_signed_in(&self) -> bool {
        self.token
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
