//! Element watchers: list+watch each element kind and feed events into the worker queue.

use anyhow::Result;
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client,
};
use lso_core::ElementKind;
use lso_reconcile::ElementEvent;
use metrics::counter;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{api_resource, to_json};

/// One queued element event. `attempt` counts re-deliveries after retryable failures.
#[derive(Debug, Clone)]
pub struct ElementDelivery {
    pub kind: ElementKind,
    pub event: ElementEvent,
    pub attempt: u32,
}

impl ElementDelivery {
    pub fn new(kind: ElementKind, event: ElementEvent) -> Self { Self { kind, event, attempt: 0 } }

    pub fn retry(self) -> Self { Self { attempt: self.attempt + 1, ..self } }
}

/// List+watch one element kind until the receiver goes away. Stream errors are logged and the
/// watch resumes with backoff. A relist replays every object as `Applied`; the handler skips the
/// ones whose change was already propagated.
pub async fn watch_elements(
    client: Client,
    kind: ElementKind,
    namespace: Option<String>,
    tx: mpsc::Sender<ElementDelivery>,
) -> Result<()> {
    let ar = api_resource(kind.object_kind());
    let api: Api<DynamicObject> = match namespace.as_deref() {
        Some(ns) => Api::namespaced_with(client, ns, &ar),
        None => Api::all_with(client, &ar),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?namespace, "element watcher started");
    while let Some(ev) = stream.next().await {
        let ev = match ev {
            Ok(ev) => ev,
            Err(e) => {
                warn!(kind = %kind, error = %e, "watch error; resuming");
                continue;
            }
        };
        let batch = element_events(kind, ev);
        for event in batch {
            if tx.send(ElementDelivery::new(kind, event)).await.is_err() {
                info!(kind = %kind, "element queue closed; watcher stopping");
                return Ok(());
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
    Ok(())
}

/// Turn one watch event into queue events. An object that fails to convert is logged and
/// dropped; the rest of the batch and the watch itself carry on.
fn element_events(kind: ElementKind, ev: Event<DynamicObject>) -> Vec<ElementEvent> {
    let convert = |o: &DynamicObject| match to_json(o) {
        Ok(raw) => Some(raw),
        Err(e) => {
            warn!(kind = %kind, name = ?o.metadata.name, error = %e, "dropping unconvertible watch object");
            None
        }
    };
    match ev {
        Event::Applied(o) => convert(&o).map(ElementEvent::Applied).into_iter().collect(),
        Event::Deleted(o) => convert(&o).map(ElementEvent::Deleted).into_iter().collect(),
        Event::Restarted(list) => {
            debug!(kind = %kind, count = list.len(), "watch restart");
            counter!("watch_restarts_total", 1u64, "kind" => kind.object_kind().kind());
            list.iter().filter_map(convert).map(ElementEvent::Applied).collect()
        }
    }
}

/// One watcher task per element kind.
pub fn spawn_element_watchers(client: Client, namespace: Option<String>, tx: mpsc::Sender<ElementDelivery>) -> Vec<JoinHandle<()>> {
    ElementKind::ALL
        .into_iter()
        .map(|kind| {
            let (client, namespace, tx) = (client.clone(), namespace.clone(), tx.clone());
            tokio::spawn(async move {
                if let Err(e) = watch_elements(client, kind, namespace, tx).await {
                    warn!(kind = %kind, error = ?e, "element watcher failed");
                }
            })
        })
        .collect()
}
