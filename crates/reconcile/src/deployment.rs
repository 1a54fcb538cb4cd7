//! Deployment reconciler: engine config, pipeline locations, the StatefulSet and one Service per
//! selected input.
//!
//! Path selection:
//! - no `status.statefulSet` yet: create everything, tolerating leftovers of an interrupted run;
//! - fingerprint unchanged but replicas differ: patch `spec.replicas` only;
//! - otherwise: converge every artifact, recreating any that went missing.

use std::collections::BTreeSet;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lso_core::{meta, names, selector, store, DeploymentSpec, DeploymentStatus, Element, ElementKind, Json, ObjectKind, DEPLOYMENT_LABEL};
use lso_render::{adopt, params, PipelineParam, PortParam, Template};
use metrics::counter;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::{spec_of, status_of, Context, Owner, ReconcileError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPath {
    Create,
    Scale,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentOutcome {
    pub path: ApplyPath,
    pub exposures: Vec<String>,
    /// Exposure artifacts deleted because their input no longer matches.
    pub removed: Vec<String>,
}

/// A selected input and the Service exposing it.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Exposure {
    name: String,
    input: String,
    port: i32,
}

/// Everything rendered for one reconcile.
struct Plan {
    config: Json,
    locations: Json,
    workload: Json,
    services: Vec<(Exposure, Json)>,
}

pub async fn reconcile_deployment(ctx: &Context, obj: &Json) -> Result<DeploymentOutcome, ReconcileError> {
    let owner = Owner::from_object(ObjectKind::Deployment, obj)?;
    let status: DeploymentStatus = status_of(obj);
    let result = reconcile_inner(ctx, &owner, obj, &status).await;
    match &result {
        Err(ReconcileError::Permanent(msg)) => report_error(ctx, &owner, &status, msg).await,
        Err(e @ ReconcileError::Render(_)) => report_error(ctx, &owner, &status, &e.to_string()).await,
        _ => {}
    }
    result
}

async fn reconcile_inner(ctx: &Context, owner: &Owner, obj: &Json, status: &DeploymentStatus) -> Result<DeploymentOutcome, ReconcileError> {
    let spec: DeploymentSpec = spec_of(owner, obj)?;
    let replicas = match spec.replicas {
        Some(n) if n > 0 => n,
        other => return Err(ReconcileError::Permanent(format!("replicas must be set to a positive number, got {:?}", other))),
    };
    let exposures = resolve_exposures(ctx, owner, spec.selector.as_ref()).await?;
    let fingerprint = fingerprint(&spec, &exposures);
    let plan = render_plan(ctx, owner, &spec, replicas, &exposures)?;

    let path = match (&status.stateful_set, &status.fingerprint) {
        (None, _) => ApplyPath::Create,
        (Some(_), Some(fp)) if *fp == fingerprint && status.replicas != Some(replicas) => ApplyPath::Scale,
        _ => ApplyPath::Full,
    };
    let path = match path {
        ApplyPath::Create => {
            create_all(ctx, owner, &plan).await?;
            ApplyPath::Create
        }
        ApplyPath::Scale => match scale(ctx, owner, replicas).await {
            Ok(()) => ApplyPath::Scale,
            Err(ReconcileError::Store(e)) if e.is_not_found() => {
                warn!(deployment = %owner.name, ns = %owner.namespace, "workload missing during scale; converging everything");
                converge_all(ctx, owner, &plan).await?;
                ApplyPath::Full
            }
            Err(e) => return Err(e),
        },
        ApplyPath::Full => {
            converge_all(ctx, owner, &plan).await?;
            ApplyPath::Full
        }
    };
    let removed = if path == ApplyPath::Scale { Vec::new() } else { remove_stale_exposures(ctx, owner, &exposures).await? };
    let exposure_names: Vec<String> = exposures.iter().map(|e| e.name.clone()).collect();
    info!(deployment = %owner.name, ns = %owner.namespace, ?path, replicas, exposures = exposure_names.len(), removed = removed.len(), "deployment reconciled");

    let next = DeploymentStatus {
        stateful_set: Some(names::workload(&owner.name)),
        replicas: Some(replicas),
        fingerprint: Some(fingerprint),
        exposures: exposure_names.clone(),
        observed_generation: Some(meta::generation_counter(obj)),
        error: None,
    };
    if *status != next {
        let mut patch = json!({ "status": next });
        // Unset fields are skipped on serialization; a cleared error has to go out as null
        patch["status"]["error"] = Json::Null;
        ctx.store().patch_status(ObjectKind::Deployment, &owner.namespace, &owner.name, &patch).await?;
    }
    Ok(DeploymentOutcome { path, exposures: exposure_names, removed })
}

/// Record a configuration error on the deployment's status. Failure to record is only logged.
async fn report_error(ctx: &Context, owner: &Owner, status: &DeploymentStatus, msg: &str) {
    warn!(deployment = %owner.name, ns = %owner.namespace, error = %msg, "deployment configuration error");
    if status.error.as_deref() == Some(msg) {
        return;
    }
    let patch = json!({ "status": { "error": msg } });
    if let Err(e) = ctx.store().patch_status(ObjectKind::Deployment, &owner.namespace, &owner.name, &patch).await {
        warn!(deployment = %owner.name, error = %e, "failed to record configuration error");
    }
}

async fn resolve_exposures(ctx: &Context, owner: &Owner, sel: Option<&LabelSelector>) -> Result<Vec<Exposure>, ReconcileError> {
    let Some(sel) = sel else { return Ok(Vec::new()) };
    let inputs = ctx.store().list(ObjectKind::Input, &owner.namespace, sel).await?;
    let mut out = Vec::new();
    for obj in &inputs {
        let input = match Element::from_object(ElementKind::Input, obj) {
            Ok(e) => e,
            Err(e) => {
                warn!(deployment = %owner.name, error = %e, "skipping unparsable input");
                continue;
            }
        };
        if let Err(msg) = input.validate() {
            warn!(deployment = %owner.name, input = %input.name, error = %msg, "skipping invalid input");
            continue;
        }
        match input.port {
            Some(port) if (1..=65535).contains(&port) => {
                out.push(Exposure { name: names::exposure(&owner.name, &input.name), input: input.name, port })
            }
            other => debug!(deployment = %owner.name, input = %input.name, port = ?other, "input has no usable port; not exposed"),
        }
    }
    out.sort_by(|a, b| a.input.cmp(&b.input));
    Ok(out)
}

/// Fingerprint of every input to the rendered artifacts except the replica count.
fn fingerprint(spec: &DeploymentSpec, exposures: &[Exposure]) -> String {
    let mut parts: Vec<String> = vec![spec.config.clone().unwrap_or_default(), spec.image.clone().unwrap_or_default()];
    parts.extend(spec.pipelines.iter().map(|p| format!("pipeline:{}:{}", p.name, p.workers.map(|w| w.to_string()).unwrap_or_default())));
    parts.extend(exposures.iter().map(|e| format!("exposure:{}={}", e.name, e.port)));
    lso_core::fingerprint(parts.iter().map(String::as_str))
}

fn render_plan(ctx: &Context, owner: &Owner, spec: &DeploymentSpec, replicas: i32, exposures: &[Exposure]) -> Result<Plan, ReconcileError> {
    let r = &ctx.renderer;
    let owner_ref = owner.reference();
    let pipelines: Vec<PipelineParam> = spec.pipelines.iter().map(|p| PipelineParam { name: p.name.clone(), workers: p.workers }).collect();
    let ports: Vec<PortParam> = exposures.iter().map(|e| PortParam { name: e.name.clone(), port: e.port }).collect();
    let config_text = spec.config.clone().unwrap_or_default();

    let mut config = r.render(
        Template::EngineConfig,
        &params(json!({ "name": names::config_artifact(&owner.name), "deployment": owner.name, "config": config_text })),
    )?;
    let mut locations = r.render(
        Template::PipelineLocations,
        &params(json!({ "name": names::pipelines_artifact(&owner.name), "deployment": owner.name, "pipelines": pipelines })),
    )?;
    let mut workload = r.render(
        Template::Workload,
        &params(json!({
            "name": names::workload(&owner.name),
            "deployment": owner.name,
            "replicas": replicas,
            "image": spec.image,
            "pipelines": pipelines,
            "ports": ports,
            "config_artifact": names::config_artifact(&owner.name),
            "pipelines_artifact": names::pipelines_artifact(&owner.name),
            "config_hash": lso_core::fingerprint([config_text.as_str()]),
        })),
    )?;
    adopt(&mut config, &owner_ref);
    adopt(&mut locations, &owner_ref);
    adopt(&mut workload, &owner_ref);
    let mut services = Vec::with_capacity(exposures.len());
    for e in exposures {
        let mut svc = r.render(
            Template::Exposure,
            &params(json!({ "name": e.name, "deployment": owner.name, "input": e.input, "port": e.port })),
        )?;
        adopt(&mut svc, &owner_ref);
        services.push((e.clone(), svc));
    }
    Ok(Plan { config, locations, workload, services })
}

fn name_of(body: &Json) -> &str { meta::name(body).unwrap_or_default() }

/// First-sight path: create in dependency order; "already exists" means an earlier attempt got there.
async fn create_all(ctx: &Context, owner: &Owner, plan: &Plan) -> Result<(), ReconcileError> {
    let ns = owner.namespace.as_str();
    for (kind, body) in [
        (ObjectKind::ConfigMap, &plan.config),
        (ObjectKind::ConfigMap, &plan.locations),
        (ObjectKind::StatefulSet, &plan.workload),
    ] {
        let created = store::create_idempotent(ctx.store(), kind, ns, body).await?;
        note_create(owner, kind, name_of(body), created);
    }
    for (_, svc) in &plan.services {
        let created = store::create_idempotent(ctx.store(), ObjectKind::Service, ns, svc).await?;
        note_create(owner, ObjectKind::Service, name_of(svc), created);
    }
    Ok(())
}

fn note_create(owner: &Owner, kind: ObjectKind, name: &str, created: bool) {
    if created {
        counter!("artifact_writes_total", 1u64, "verb" => "create", "kind" => kind.kind());
        debug!(deployment = %owner.name, kind = %kind, artifact = %name, "created");
    } else {
        debug!(deployment = %owner.name, kind = %kind, artifact = %name, "already present");
    }
}

/// Scale fast path: only `spec.replicas` of the workload.
async fn scale(ctx: &Context, owner: &Owner, replicas: i32) -> Result<(), ReconcileError> {
    let patch = json!({ "spec": { "replicas": replicas } });
    ctx.store()
        .patch(ObjectKind::StatefulSet, &owner.namespace, &names::workload(&owner.name), &patch)
        .await?;
    counter!("artifact_writes_total", 1u64, "verb" => "patch", "kind" => "StatefulSet");
    Ok(())
}

async fn converge_all(ctx: &Context, owner: &Owner, plan: &Plan) -> Result<(), ReconcileError> {
    converge_config_map(ctx, owner, &plan.config).await?;
    converge_config_map(ctx, owner, &plan.locations).await?;
    let workload_patch = json!({
        "metadata": { "labels": plan.workload["metadata"]["labels"] },
        "spec": { "replicas": plan.workload["spec"]["replicas"], "template": plan.workload["spec"]["template"] }
    });
    patch_or_create(ctx, owner, ObjectKind::StatefulSet, &plan.workload, &workload_patch).await?;
    for (e, svc) in &plan.services {
        upsert_exposure(ctx, owner, e, svc).await?;
    }
    Ok(())
}

/// Make a ConfigMap's `data` equal the rendered one; skipped when it already is.
async fn converge_config_map(ctx: &Context, owner: &Owner, body: &Json) -> Result<(), ReconcileError> {
    let name = name_of(body);
    let Some(live) = store::get_opt(ctx.store(), ObjectKind::ConfigMap, &owner.namespace, name).await? else {
        let created = store::create_idempotent(ctx.store(), ObjectKind::ConfigMap, &owner.namespace, body).await?;
        note_create(owner, ObjectKind::ConfigMap, name, created);
        return Ok(());
    };
    let desired = meta::data(body);
    let current = meta::data(&live);
    if desired == current {
        return Ok(());
    }
    let mut data = serde_json::Map::new();
    for (k, v) in &desired {
        data.insert(k.clone(), Json::String(v.clone()));
    }
    for k in current.keys().filter(|k| !desired.contains_key(*k)) {
        data.insert(k.clone(), Json::Null);
    }
    let mut patch = json!({ "data": data });
    if let Some(rv) = meta::resource_version(&live) {
        patch["metadata"] = json!({ "resourceVersion": rv });
    }
    ctx.store().patch(ObjectKind::ConfigMap, &owner.namespace, name, &patch).await?;
    counter!("artifact_writes_total", 1u64, "verb" => "patch", "kind" => "ConfigMap");
    Ok(())
}

/// Patch; if the artifact was deleted behind our back, create it from the full body.
async fn patch_or_create(ctx: &Context, owner: &Owner, kind: ObjectKind, body: &Json, patch: &Json) -> Result<(), ReconcileError> {
    let name = name_of(body);
    match ctx.store().patch(kind, &owner.namespace, name, patch).await {
        Ok(_) => {
            counter!("artifact_writes_total", 1u64, "verb" => "patch", "kind" => kind.kind());
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            let created = store::create_idempotent(ctx.store(), kind, &owner.namespace, body).await?;
            note_create(owner, kind, name, created);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Read, then create if absent or replace the managed fields if present. Two reconciles racing here
/// can both see "absent"; the loser's create fails with "already exists" and counts as satisfied, and
/// the winner's content stands until the next reconcile.
async fn upsert_exposure(ctx: &Context, owner: &Owner, e: &Exposure, svc: &Json) -> Result<(), ReconcileError> {
    match store::get_opt(ctx.store(), ObjectKind::Service, &owner.namespace, &e.name).await? {
        None => {
            let created = store::create_idempotent(ctx.store(), ObjectKind::Service, &owner.namespace, svc).await?;
            note_create(owner, ObjectKind::Service, &e.name, created);
            Ok(())
        }
        Some(_) => {
            let patch = json!({
                "metadata": { "labels": svc["metadata"]["labels"] },
                "spec": { "selector": svc["spec"]["selector"], "ports": svc["spec"]["ports"] }
            });
            patch_or_create(ctx, owner, ObjectKind::Service, svc, &patch).await
        }
    }
}

/// Delete labeled exposures whose input is no longer selected.
async fn remove_stale_exposures(ctx: &Context, owner: &Owner, exposures: &[Exposure]) -> Result<Vec<String>, ReconcileError> {
    let keep: BTreeSet<&str> = exposures.iter().map(|e| e.name.as_str()).collect();
    let sel = selector::from_labels([(DEPLOYMENT_LABEL, owner.name.as_str())]);
    let live = ctx.store().list(ObjectKind::Service, &owner.namespace, &sel).await?;
    let mut removed = Vec::new();
    for svc in &live {
        let Some(name) = meta::name(svc) else { continue };
        if keep.contains(name) {
            continue;
        }
        if store::delete_idempotent(ctx.store(), ObjectKind::Service, &owner.namespace, name).await? {
            counter!("artifact_writes_total", 1u64, "verb" => "delete", "kind" => "Service");
        }
        info!(deployment = %owner.name, ns = %owner.namespace, service = %name, "removed stale exposure");
        removed.push(name.to_string());
    }
    Ok(removed)
}
