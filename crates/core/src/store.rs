//! Contract of the object store the engine reads and writes.
//!
//! Implementations report failures and never retry: retry belongs to whoever re-invokes the reconcile.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

use crate::ObjectKind;

pub type Json = serde_json::Value;

/// Store failures. `NotFound`, `AlreadyExists` and `Conflict` are distinguishable so callers can treat
/// expected absence/presence as control flow; everything else is opaque.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not_found: {kind} {namespace}/{name}")]
    NotFound { kind: ObjectKind, namespace: String, name: String },
    #[error("already_exists: {kind} {namespace}/{name}")]
    AlreadyExists { kind: ObjectKind, namespace: String, name: String },
    #[error("conflict: {kind} {namespace}/{name}: {message}")]
    Conflict { kind: ObjectKind, namespace: String, name: String, message: String },
    #[error("invalid: {0}")]
    Invalid(String),
    #[error("backend: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        StoreError::NotFound { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn already_exists(kind: ObjectKind, namespace: &str, name: &str) -> Self {
        StoreError::AlreadyExists { kind, namespace: namespace.to_string(), name: name.to_string() }
    }

    pub fn conflict(kind: ObjectKind, namespace: &str, name: &str, message: impl Into<String>) -> Self {
        StoreError::Conflict { kind, namespace: namespace.to_string(), name: name.to_string(), message: message.into() }
    }

    pub fn is_not_found(&self) -> bool { matches!(self, StoreError::NotFound { .. }) }
    pub fn is_already_exists(&self) -> bool { matches!(self, StoreError::AlreadyExists { .. }) }
    pub fn is_conflict(&self) -> bool { matches!(self, StoreError::Conflict { .. }) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Namespaced object operations over raw JSON bodies.
///
/// `patch` and `patch_status` take an RFC 7386 merge patch. A patch carrying
/// `metadata.resourceVersion` must be rejected with `Conflict` when the live version differs.
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json>;

    /// Create from a full body; `metadata.name` is required.
    async fn create(&self, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json>;

    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json>;

    async fn patch_status(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json>;

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()>;

    async fn list(&self, kind: ObjectKind, namespace: &str, selector: &LabelSelector) -> StoreResult<Vec<Json>>;
}

/// `get` with expected absence folded into `None`.
pub async fn get_opt(store: &dyn ArtifactStore, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Option<Json>> {
    match store.get(kind, namespace, name).await {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// `create` with a defensive "already exists" folded into `Ok(false)`.
pub async fn create_idempotent(store: &dyn ArtifactStore, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<bool> {
    match store.create(kind, namespace, body).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_already_exists() => Ok(false),
        Err(e) => Err(e),
    }
}

/// `delete` treating an already-gone object as done.
pub async fn delete_idempotent(store: &dyn ArtifactStore, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<bool> {
    match store.delete(kind, namespace, name).await {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}
