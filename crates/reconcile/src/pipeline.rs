//! Pipeline reconciler: keeps `logstash-pipeline-<name>` equal to the assembly of its selected elements.

use std::collections::BTreeMap;

use lso_core::{meta, names, store, ElementKind, Json, ObjectKind, PipelineSpec, PipelineStatus};
use lso_render::{adopt, params, Template};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info};

use crate::assembler::{assemble, assemble_all, Blocks};
use crate::{spec_of, status_of, Context, Owner, ReconcileError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub artifact: String,
    /// The artifact did not exist and was created during this reconcile.
    pub created: bool,
    /// Content was written.
    pub patched: bool,
    pub keys: Vec<String>,
}

/// Full reconcile of one pipeline object.
pub async fn reconcile_pipeline(ctx: &Context, obj: &Json) -> Result<PipelineOutcome, ReconcileError> {
    let owner = Owner::from_object(ObjectKind::Pipeline, obj)?;
    let spec: PipelineSpec = spec_of(&owner, obj)?;
    let (current, created) = ensure_artifact(ctx, &owner).await?;
    let desired = assemble_all(ctx.store(), &owner.namespace, &spec.selector).await?;
    let patched = sync_blocks(ctx, &owner, &current, &desired, |_| true).await?;
    let keys: Vec<String> = desired.iter().map(|(k, _)| k.clone()).collect();
    info!(pipeline = %owner.name, ns = %owner.namespace, keys = keys.len(), created, patched, "pipeline reconciled");

    let status = PipelineStatus {
        artifact: Some(names::pipeline_artifact(&owner.name)),
        keys: keys.clone(),
        observed_generation: Some(meta::generation_counter(obj)),
    };
    if status_of::<PipelineStatus>(obj) != status {
        ctx.store()
            .patch_status(ObjectKind::Pipeline, &owner.namespace, &owner.name, &json!({ "status": status }))
            .await?;
    }
    Ok(PipelineOutcome { artifact: names::pipeline_artifact(&owner.name), created, patched, keys })
}

/// Re-assemble only the blocks of `kind`, leaving other kinds' keys alone. Used to apply an element
/// change right away, ahead of the full reconcile its propagation triggers.
pub async fn refresh_kind(ctx: &Context, obj: &Json, kind: ElementKind) -> Result<bool, ReconcileError> {
    let owner = Owner::from_object(ObjectKind::Pipeline, obj)?;
    let spec: PipelineSpec = spec_of(&owner, obj)?;
    let (current, _) = ensure_artifact(ctx, &owner).await?;
    let desired = assemble(ctx.store(), &owner.namespace, &spec.selector, kind).await?;
    sync_blocks(ctx, &owner, &current, &desired, |k| kind.owns_key(k)).await
}

/// Fetch the pipeline's artifact, creating it empty on first sight so later patches have a target.
async fn ensure_artifact(ctx: &Context, owner: &Owner) -> Result<(Json, bool), ReconcileError> {
    let name = names::pipeline_artifact(&owner.name);
    if let Some(live) = store::get_opt(ctx.store(), ObjectKind::ConfigMap, &owner.namespace, &name).await? {
        return Ok((live, false));
    }
    let mut body = ctx
        .renderer
        .render(Template::PipelineArtifact, &params(json!({ "name": name, "pipeline": owner.name })))?;
    adopt(&mut body, &owner.reference());
    match ctx.store().create(ObjectKind::ConfigMap, &owner.namespace, &body).await {
        Ok(created) => {
            counter!("artifact_writes_total", 1u64, "verb" => "create", "kind" => "ConfigMap");
            debug!(artifact = %name, ns = %owner.namespace, "pipeline artifact created");
            Ok((created, true))
        }
        // Lost a race with another writer: use theirs
        Err(e) if e.is_already_exists() => Ok((ctx.store().get(ObjectKind::ConfigMap, &owner.namespace, &name).await?, false)),
        Err(e) => Err(e.into()),
    }
}

/// Merge-patch `data` so that keys selected by `in_scope` equal `desired` exactly. The patch carries
/// the live resourceVersion; a concurrent write turns into a `Conflict` for the caller.
async fn sync_blocks(
    ctx: &Context,
    owner: &Owner,
    current: &Json,
    desired: &Blocks,
    in_scope: impl Fn(&str) -> bool,
) -> Result<bool, ReconcileError> {
    let live = meta::data(current);
    let wanted: BTreeMap<&str, &str> = desired.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
    let mut changes = serde_json::Map::new();
    for (k, v) in &wanted {
        if live.get(*k).map(String::as_str) != Some(*v) {
            changes.insert((*k).to_string(), Json::String((*v).to_string()));
        }
    }
    for k in live.keys() {
        if in_scope(k) && !wanted.contains_key(k.as_str()) {
            changes.insert(k.clone(), Json::Null);
        }
    }
    if changes.is_empty() {
        return Ok(false);
    }
    let name = names::pipeline_artifact(&owner.name);
    let changed = changes.len();
    let mut patch = json!({ "data": changes });
    if let Some(rv) = meta::resource_version(current) {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    ctx.store().patch(ObjectKind::ConfigMap, &owner.namespace, &name, &patch).await?;
    counter!("artifact_writes_total", 1u64, "verb" => "patch", "kind" => "ConfigMap");
    debug!(artifact = %name, ns = %owner.namespace, changed, "pipeline artifact patched");
    Ok(true)
}
