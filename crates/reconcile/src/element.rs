//! Element events: apply the change to matching pipelines right away, then propagate.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lso_core::{meta, selector, Element, ElementKind, ElementStatus, Json, ObjectKind, PipelineSpec};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::pipeline::refresh_kind;
use crate::propagate::{propagate, PropagationReport};
use crate::{status_of, Context, ReconcileError};

/// Element change as delivered by the watch layer. Deletions carry the last known object.
#[derive(Debug, Clone)]
pub enum ElementEvent {
    Applied(Json),
    Deleted(Json),
}

impl ElementEvent {
    pub fn object(&self) -> &Json {
        match self {
            ElementEvent::Applied(o) | ElementEvent::Deleted(o) => o,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementOutcome {
    /// The change had already been propagated.
    pub skipped: bool,
    /// Pipelines whose artifact was updated directly.
    pub refreshed: Vec<String>,
    pub report: PropagationReport,
}

pub async fn handle_element(ctx: &Context, kind: ElementKind, event: &ElementEvent) -> Result<ElementOutcome, ReconcileError> {
    let obj = event.object();
    let element = Element::from_object(kind, obj).map_err(|e| ReconcileError::Permanent(e.to_string()))?;
    match event {
        ElementEvent::Applied(_) => {
            let fp = element.fingerprint();
            let status: ElementStatus = status_of(obj);
            if status.propagated.as_deref() == Some(fp.as_str()) {
                debug!(kind = %kind, ns = %element.namespace, name = %element.name, "already propagated");
                return Ok(ElementOutcome { skipped: true, ..Default::default() });
            }
            if let Err(msg) = element.validate() {
                write_status(ctx, &element, ElementStatus { propagated: Some(fp), error: Some(msg.clone()) }).await;
                return Err(ReconcileError::Permanent(msg));
            }
            let outcome = apply_change(ctx, &element).await?;
            write_status(ctx, &element, ElementStatus { propagated: Some(fp), error: None }).await;
            Ok(outcome)
        }
        ElementEvent::Deleted(_) => apply_change(ctx, &element).await,
    }
}

async fn apply_change(ctx: &Context, element: &Element) -> Result<ElementOutcome, ReconcileError> {
    let refreshed = refresh_pipelines(ctx, element).await;
    let report = propagate(ctx, &element.namespace, element.kind).await?;
    info!(
        kind = %element.kind, ns = %element.namespace, name = %element.name,
        refreshed = refreshed.len(), pipelines = report.pipelines, deployments = report.deployments,
        "element change propagated"
    );
    Ok(ElementOutcome { skipped: false, refreshed, report })
}

/// Direct update of the pipelines selecting the element's current labels. Best effort: the full
/// reconcile triggered by propagation covers anything missed here, including pipelines that only
/// matched the element's previous labels.
async fn refresh_pipelines(ctx: &Context, element: &Element) -> Vec<String> {
    let pipelines = match ctx.store().list(ObjectKind::Pipeline, &element.namespace, &LabelSelector::default()).await {
        Ok(p) => p,
        Err(e) => {
            warn!(ns = %element.namespace, error = %e, "listing pipelines for direct refresh failed");
            return Vec::new();
        }
    };
    let mut refreshed = Vec::new();
    for p in &pipelines {
        let name = meta::name(p).unwrap_or_default().to_string();
        let sel = p.get("spec").cloned().and_then(|s| serde_json::from_value::<PipelineSpec>(s).ok()).map(|s| s.selector);
        let Some(sel) = sel else { continue };
        if !selector::matches(&sel, &element.labels) {
            continue;
        }
        match refresh_kind(ctx, p, element.kind).await {
            Ok(true) => refreshed.push(name),
            Ok(false) => {}
            Err(e) => warn!(pipeline = %name, ns = %element.namespace, error = %e, "direct refresh failed; relying on propagation"),
        }
    }
    refreshed
}

async fn write_status(ctx: &Context, element: &Element, status: ElementStatus) {
    let patch = json!({ "status": { "propagated": status.propagated, "error": status.error } });
    if let Err(e) = ctx.store().patch_status(element.kind.object_kind(), &element.namespace, &element.name, &patch).await {
        // Next delivery sees no fingerprint and propagates again, which is harmless
        warn!(kind = %element.kind, name = %element.name, error = %e, "element status update failed");
    }
}
