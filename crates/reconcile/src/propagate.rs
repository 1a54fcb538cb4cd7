//! Change propagation: mark dependents dirty by advancing their generation annotation.
//!
//! Every pipeline in the namespace is bumped on any element change, and every deployment on input
//! changes. Which pipelines referenced the element before the change is unknowable from its current
//! state (labels may have moved), so the fan-out is deliberately unfiltered.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lso_core::{meta, ElementKind, ObjectKind, StoreError, GENERATION_ANNOTATION};
use metrics::counter;
use serde_json::json;
use tracing::{debug, warn};

use crate::{Context, ReconcileError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropagationReport {
    pub pipelines: usize,
    pub deployments: usize,
}

pub async fn propagate(ctx: &Context, namespace: &str, kind: ElementKind) -> Result<PropagationReport, ReconcileError> {
    let mut targets = vec![ObjectKind::Pipeline];
    if kind == ElementKind::Input {
        targets.push(ObjectKind::Deployment);
    }
    let mut report = PropagationReport::default();
    let mut total = 0usize;
    let mut failures: Vec<StoreError> = Vec::new();
    for target in targets {
        let objects = ctx.store().list(target, namespace, &LabelSelector::default()).await?;
        for obj in &objects {
            let Some(name) = meta::name(obj) else { continue };
            total += 1;
            // Keep going on failure: skipping later dependents would lose their signal entirely
            match bump(ctx, target, namespace, name).await {
                Ok(true) => match target {
                    ObjectKind::Deployment => report.deployments += 1,
                    _ => report.pipelines += 1,
                },
                Ok(false) => {}
                Err(e) => {
                    warn!(kind = %target, ns = %namespace, name = %name, error = %e, "generation bump failed");
                    failures.push(e);
                }
            }
        }
    }
    debug!(element = %kind, ns = %namespace, pipelines = report.pipelines, deployments = report.deployments, "propagated");
    match failures.pop() {
        None => Ok(report),
        Some(last) => Err(ReconcileError::Propagation { failed: failures.len() + 1, total, last }),
    }
}

/// Increment one object's generation annotation by 1. Conflicts re-read and retry up to the configured
/// attempts. `Ok(false)` means the object disappeared, which needs no signal.
pub async fn bump(ctx: &Context, kind: ObjectKind, namespace: &str, name: &str) -> Result<bool, StoreError> {
    let attempts = ctx.settings.bump_attempts.max(1);
    let mut last = None;
    for attempt in 1..=attempts {
        let live = match ctx.store().get(kind, namespace, name).await {
            Ok(v) => v,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e),
        };
        let next = meta::generation_counter(&live) + 1;
        let mut md = json!({ "annotations": { GENERATION_ANNOTATION: next.to_string() } });
        if let Some(rv) = meta::resource_version(&live) {
            md["resourceVersion"] = json!(rv);
        }
        match ctx.store().patch(kind, namespace, name, &json!({ "metadata": md })).await {
            Ok(_) => {
                counter!("generation_bumps_total", 1u64, "kind" => kind.kind());
                debug!(kind = %kind, ns = %namespace, name = %name, generation = next, attempt, "bumped");
                return Ok(true);
            }
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) if e.is_conflict() => last = Some(e),
            Err(e) => return Err(e),
        }
    }
    Err(last.unwrap_or_else(|| StoreError::conflict(kind, namespace, name, "generation bump attempts exhausted")))
}
