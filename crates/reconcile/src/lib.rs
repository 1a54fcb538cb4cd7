//! Reconciliation engine.
//!
//! Every entry point re-reads current store state: nothing is cached between invocations and no
//! event payload is trusted beyond identifying what to look at. Content writes surface conflicts to
//! the caller; only generation bumps (see [`propagate`]) retry in place.

#![forbid(unsafe_code)]

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use lso_core::{meta, ArtifactStore, Json, ObjectKind};
use lso_render::Renderer;

pub mod assembler;
pub mod deployment;
pub mod element;
pub mod error;
pub mod pipeline;
pub mod propagate;

pub use assembler::{assemble, assemble_elements, Blocks};
pub use deployment::{reconcile_deployment, ApplyPath, DeploymentOutcome};
pub use element::{handle_element, ElementEvent, ElementOutcome};
pub use error::ReconcileError;
pub use pipeline::{reconcile_pipeline, PipelineOutcome};
pub use propagate::{propagate, PropagationReport};

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Attempts per generation bump before the propagation is reported as failed.
    pub bump_attempts: u32,
}

impl Default for Settings {
    fn default() -> Self { Self { bump_attempts: 3 } }
}

/// Shared, immutable state handed to every reconcile.
pub struct Context {
    pub store: Arc<dyn ArtifactStore>,
    pub renderer: Renderer,
    pub settings: Settings,
}

impl Context {
    pub fn new(store: Arc<dyn ArtifactStore>, renderer: Renderer, settings: Settings) -> Self {
        Self { store, renderer, settings }
    }

    pub fn store(&self) -> &dyn ArtifactStore { self.store.as_ref() }
}

/// Identity of a pipeline or deployment that owns generated artifacts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl Owner {
    pub fn from_object(kind: ObjectKind, obj: &Json) -> Result<Self, ReconcileError> {
        let name = meta::name(obj).ok_or_else(|| ReconcileError::Permanent(format!("{} without metadata.name", kind)))?;
        let namespace = meta::namespace(obj).ok_or_else(|| ReconcileError::Permanent(format!("{} {} is not namespaced", kind, name)))?;
        let uid = meta::uid(obj).ok_or_else(|| ReconcileError::MissingUid(format!("{} {}/{}", kind, namespace, name)))?;
        Ok(Self { kind, namespace: namespace.to_string(), name: name.to_string(), uid: uid.to_string() })
    }

    /// Controlling owner reference attached to every generated artifact.
    pub fn reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.kind.api_version(),
            kind: self.kind.kind().to_string(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

impl std::fmt::Display for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// Parse `spec` of a raw object into its typed form; a malformed spec is a configuration error.
pub(crate) fn spec_of<T: serde::de::DeserializeOwned>(owner: &Owner, obj: &Json) -> Result<T, ReconcileError> {
    let spec = obj.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(spec).map_err(|e| ReconcileError::Permanent(format!("{}: invalid spec: {}", owner, e)))
}

/// Parse `status`, treating absent or foreign shapes as empty.
pub(crate) fn status_of<T: serde::de::DeserializeOwned + Default>(obj: &Json) -> T {
    obj.get("status").cloned().and_then(|s| serde_json::from_value(s).ok()).unwrap_or_default()
}
