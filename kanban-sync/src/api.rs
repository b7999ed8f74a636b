//! REST access to the kanban backend.
//!
//! Every response is wrapped in the backend's `{ success, data, message }`
//! envelope. Status codes map onto [`SyncError`] so callers can tell rate
//! limits, auth failures and server errors apart.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use kanban_sync_types::{Entity, EntityId, ResourceKey, ResourceKind};
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// REST operations the sync layer needs from the backend.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// Lists every entity of `key`.
    async fn list(&self, key: &ResourceKey, token: &str) -> SyncResult<Vec<Entity>>;

    /// Creates an entity and returns the server's copy.
    async fn create(&self, key: &ResourceKey, entity: &Entity, token: &str) -> SyncResult<Entity>;

    /// Replaces an entity and returns the server's copy.
    async fn update(&self, key: &ResourceKey, entity: &Entity, token: &str) -> SyncResult<Entity>;

    async fn delete(&self, key: &ResourceKey, id: &EntityId, token: &str) -> SyncResult<()>;
}

/// The backend's response envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl<T> ApiEnvelope<T> {
    fn reason(&self) -> String {
        self.message
            .clone()
            .or_else(|| self.error.clone())
            .unwrap_or_else(|| "request failed".to_string())
    }
}

/// Request paths, relative to the REST base URL.
pub mod paths {
    use super::*;

    fn scope(key: &ResourceKey) -> String {
        urlencoding::encode(key.scope().unwrap_or_default()).into_owned()
    }

    pub fn list(key: &ResourceKey) -> String {
        match key.kind() {
            ResourceKind::Projects => match key.scope() {
                Some(workspace) => {
                    format!("/api/projects?workspace_id={}", urlencoding::encode(workspace))
                }
                None => "/api/projects".to_string(),
            },
            ResourceKind::TeamIssues => format!("/api/teams/{}/issues", scope(key)),
            ResourceKind::TeamProjects => format!("/api/teams/{}/projects", scope(key)),
        }
    }

    pub fn create(key: &ResourceKey) -> String {
        match key.kind() {
            ResourceKind::Projects => "/api/projects".to_string(),
            ResourceKind::TeamIssues => "/api/tasks".to_string(),
            ResourceKind::TeamProjects => format!("/api/teams/{}/projects", scope(key)),
        }
    }

    pub fn item(key: &ResourceKey, id: &EntityId) -> String {
        let id = urlencoding::encode(id.as_str());
        match key.kind() {
            ResourceKind::Projects | ResourceKind::TeamProjects => format!("/api/projects/{id}"),
            ResourceKind::TeamIssues => format!("/api/tasks/{id}"),
        }
    }

    /// Stream endpoint for kinds the backend can stream.
    pub fn stream(key: &ResourceKey, token: &str) -> Option<String> {
        if !key.kind().supports_streaming() {
            return None;
        }
        let mut path = format!(
            "/api/{}/stream/ws?token={}",
            key.kind().as_str(),
            urlencoding::encode(token)
        );
        if let Some(workspace) = key.scope() {
            path.push_str("&workspace_id=");
            path.push_str(&urlencoding::encode(workspace));
        }
        Some(path)
    }
}

/// [`ResourceApi`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpApi {
    client: Client,
    base_url: String,
}

impl HttpApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send_entity(
        &self,
        request: reqwest::RequestBuilder,
        entity: &Entity,
        token: &str,
    ) -> SyncResult<Entity> {
        let response = request.bearer_auth(token).json(entity).send().await?;
        let data: Option<Value> = read_envelope(response).await?;
        match data {
            Some(value) => Ok(Entity::from_value(value)?),
            // Some endpoints acknowledge without echoing the entity.
            None => Ok(entity.clone()),
        }
    }
}

#[async_trait]
impl ResourceApi for HttpApi {
    async fn list(&self, key: &ResourceKey, token: &str) -> SyncResult<Vec<Entity>> {
        let url = self.url(&paths::list(key));
        debug!("GET {}", url);
        let response = self.client.get(&url).bearer_auth(token).send().await?;
        let data: Option<Vec<Value>> = read_envelope(response).await?;
        data.unwrap_or_default()
            .into_iter()
            .map(|value| Entity::from_value(value).map_err(SyncError::from))
            .collect()
    }

    async fn create(&self, key: &ResourceKey, entity: &Entity, token: &str) -> SyncResult<Entity> {
        let url = self.url(&paths::create(key));
        debug!("POST {}", url);
        self.send_entity(self.client.post(&url), entity, token).await
    }

    async fn update(&self, key: &ResourceKey, entity: &Entity, token: &str) -> SyncResult<Entity> {
        let url = self.url(&paths::item(key, entity.id()));
        debug!("PUT {}", url);
        self.send_entity(self.client.put(&url), entity, token).await
    }

    async fn delete(&self, key: &ResourceKey, id: &EntityId, token: &str) -> SyncResult<()> {
        let url = self.url(&paths::item(key, id));
        debug!("DELETE {}", url);
        let response = self.client.delete(&url).bearer_auth(token).send().await?;
        read_envelope::<Value>(response).await?;
        Ok(())
    }
}

/// Maps a response onto its envelope payload or a typed error.
async fn read_envelope<T: DeserializeOwned>(response: Response) -> SyncResult<Option<T>> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after_secs = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok());
        return Err(SyncError::RateLimited { retry_after_secs });
    }

    let body = response.text().await?;

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(SyncError::Auth(format!(
            "{}: {}",
            status.as_u16(),
            message_of(&body).unwrap_or_else(|| status.to_string())
        )));
    }
    if !status.is_success() {
        return Err(SyncError::Fetch {
            status: status.as_u16(),
            message: message_of(&body).unwrap_or_else(|| status.to_string()),
        });
    }
    if body.trim().is_empty() {
        return Ok(None);
    }

    let envelope: ApiEnvelope<T> = serde_json::from_str(&body)?;
    if !envelope.success {
        return Err(SyncError::Fetch {
            status: status.as_u16(),
            message: envelope.reason(),
        });
    }
    Ok(envelope.data)
}

fn message_of(body: &str) -> Option<String> {
    let envelope: ApiEnvelope<Value> = serde_json::from_str(body).ok()?;
    envelope.message.or(envelope.error)
}
