//! Cluster mode: one kube `Controller` per owner kind plus the element worker.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::NamespaceResourceScope;
use kube::{
    api::Api,
    runtime::{controller::Action, watcher, Controller},
    Client, Resource,
};
use lso_core::{meta, Json, LogstashDeployment, LogstashPipeline, MANAGED_BY, MANAGED_BY_LABEL};
use lso_kubehub::{spawn_element_watchers, ElementDelivery, KubeStore};
use lso_reconcile::{handle_element, Context, ReconcileError, Settings};
use lso_render::Renderer;
use metrics::{counter, histogram};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::RunArgs;

/// Shared by both controllers and the element worker.
struct Operator {
    engine: Context,
    requeue: Duration,
    backoff: Duration,
}

fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

fn to_raw<K: Serialize>(obj: &K) -> Result<Json, ReconcileError> {
    serde_json::to_value(obj).map_err(|e| ReconcileError::Permanent(format!("serializing object: {}", e)))
}

fn observe<T>(kind: &'static str, t0: Instant, res: &Result<T, ReconcileError>) {
    counter!("reconcile_total", 1u64, "kind" => kind);
    histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind);
    if let Err(e) = res {
        counter!("reconcile_errors_total", 1u64, "kind" => kind, "reason" => e.reason());
    }
}

async fn reconcile_pipeline(obj: Arc<LogstashPipeline>, op: Arc<Operator>) -> Result<Action, ReconcileError> {
    let raw = to_raw(obj.as_ref())?;
    let t0 = Instant::now();
    let res = lso_reconcile::reconcile_pipeline(&op.engine, &raw).await;
    observe("LogstashPipeline", t0, &res);
    res.map(|_| Action::requeue(op.requeue))
}

async fn reconcile_deployment(obj: Arc<LogstashDeployment>, op: Arc<Operator>) -> Result<Action, ReconcileError> {
    let raw = to_raw(obj.as_ref())?;
    let t0 = Instant::now();
    let res = lso_reconcile::reconcile_deployment(&op.engine, &raw).await;
    observe("LogstashDeployment", t0, &res);
    res.map(|_| Action::requeue(op.requeue))
}

/// Configuration errors wait for the next spec change; everything else retries after the backoff.
fn error_policy<K>(obj: Arc<K>, err: &ReconcileError, op: Arc<Operator>) -> Action
where
    K: Resource,
{
    let name = obj.meta().name.clone().unwrap_or_default();
    if err.is_permanent() {
        warn!(name = %name, error = %err, "configuration error; waiting for a change");
        Action::await_change()
    } else {
        warn!(name = %name, error = %err, "reconcile failed; retrying");
        Action::requeue(op.backoff)
    }
}

/// Processes element events one at a time. Retryable failures are re-queued after the backoff so
/// later events are not blocked behind them.
async fn element_worker(op: Arc<Operator>, mut rx: mpsc::Receiver<ElementDelivery>, tx: mpsc::Sender<ElementDelivery>) {
    while let Some(delivery) = rx.recv().await {
        let t0 = Instant::now();
        let res = handle_element(&op.engine, delivery.kind, &delivery.event).await;
        let label = delivery.kind.object_kind().kind();
        observe(label, t0, &res);
        let name = meta::name(delivery.event.object()).unwrap_or_default().to_string();
        match res {
            Ok(outcome) if outcome.skipped => debug!(kind = %delivery.kind, name = %name, "unchanged"),
            Ok(outcome) => debug!(kind = %delivery.kind, name = %name, refreshed = outcome.refreshed.len(), "handled"),
            Err(e) if e.is_permanent() => warn!(kind = %delivery.kind, name = %name, error = %e, "element rejected"),
            Err(e) => {
                warn!(kind = %delivery.kind, name = %name, attempt = delivery.attempt, error = %e, "element change failed; re-queueing");
                let (tx, backoff, retry) = (tx.clone(), op.backoff, delivery.retry());
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(retry).await;
                });
            }
        }
    }
}

pub async fn run(args: RunArgs) -> Result<()> {
    let client = lso_kubehub::get_kube_client().await?;
    let store = Arc::new(KubeStore::new(client.clone()));
    let op = Arc::new(Operator {
        engine: Context::new(store, Renderer::new(args.image.clone()), Settings { bump_attempts: args.bump_attempts }),
        requeue: Duration::from_secs(args.requeue_secs),
        backoff: Duration::from_secs(args.error_backoff_secs),
    });
    let ns = args.namespace.as_deref();
    let owned = watcher::Config::default().labels(&format!("{}={}", MANAGED_BY_LABEL, MANAGED_BY));

    let (tx, rx) = mpsc::channel(args.queue_cap.max(1));
    let watchers = spawn_element_watchers(client.clone(), args.namespace.clone(), tx.clone());
    let worker = tokio::spawn(element_worker(op.clone(), rx, tx));

    let pipelines = Controller::new(scoped::<LogstashPipeline>(&client, ns), watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns), owned.clone())
        .shutdown_on_signal()
        .run(reconcile_pipeline, error_policy, op.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(pipeline = %obj.name, ns = ?obj.namespace, "reconciled"),
                Err(e) => debug!(error = %e, "pipeline controller"),
            }
        });
    let deployments = Controller::new(scoped::<LogstashDeployment>(&client, ns), watcher::Config::default())
        .owns(scoped::<ConfigMap>(&client, ns), owned.clone())
        .owns(scoped::<StatefulSet>(&client, ns), owned.clone())
        .owns(scoped::<Service>(&client, ns), owned)
        .shutdown_on_signal()
        .run(reconcile_deployment, error_policy, op.clone())
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(deployment = %obj.name, ns = ?obj.namespace, "reconciled"),
                Err(e) => debug!(error = %e, "deployment controller"),
            }
        });
    info!("controllers running");
    tokio::join!(pipelines, deployments);

    for w in watchers {
        w.abort();
    }
    worker.abort();
    info!("shutdown complete");
    Ok(())
}
