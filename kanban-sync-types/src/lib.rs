//! Core type definitions for the kanban sync engine.
//!
//! This crate defines the shape-agnostic types shared by every layer of the
//! sync core:
//! - Entity identifiers (opaque strings, UUID v7 when generated locally)
//! - Resource kinds and scoped resource keys
//! - Opaque JSON entities and the reconciled `ResourceState`
//! - JSON-Patch operations as received on the stream
//!
//! Resource-specific fields (project names, issue status, ...) are never
//! interpreted here beyond the `id` key and each kind's sort field.

mod entity;
mod ids;
mod patch;
mod resource;

pub use entity::{Entity, ResourceState};
pub use ids::EntityId;
pub use patch::{PatchOp, PatchOperation};
pub use resource::{ResourceKey, ResourceKind};

/// Result type alias using the crate's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in type operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("entity is not a JSON object")]
    NotAnObject,

    #[error("entity has no string `id` field")]
    MissingId,

    #[error("{0} requires a scope")]
    MissingScope(ResourceKind),

    #[error("unknown resource kind: {0}")]
    UnknownKind(String),
}
