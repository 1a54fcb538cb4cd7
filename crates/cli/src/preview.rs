//! Offline preview: run the reconcilers against the in-RAM store and return what they generate.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context as _, Result};
use lso_core::{meta, ArtifactStore, Json, ObjectKind};
use lso_reconcile::{reconcile_deployment, reconcile_pipeline, Context, Settings};
use lso_render::Renderer;
use lso_store::MemStore;
use serde::Deserialize;
use tracing::warn;

const GENERATED: [ObjectKind; 3] = [ObjectKind::ConfigMap, ObjectKind::StatefulSet, ObjectKind::Service];

/// Parse multi-document YAML into `(kind, object)` pairs, defaulting the namespace.
fn load(text: &str, default_ns: &str) -> Result<Vec<(ObjectKind, Json)>> {
    let mut out = Vec::new();
    for (idx, doc) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let mut obj = Json::deserialize(doc).with_context(|| format!("document {}", idx + 1))?;
        if obj.is_null() {
            continue;
        }
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or_default();
        let kind_name = obj.get("kind").and_then(|v| v.as_str()).unwrap_or_default();
        let kind = ObjectKind::from_type_meta(api_version, kind_name)
            .filter(|k| !GENERATED.contains(k))
            .ok_or_else(|| anyhow!("document {}: unsupported kind {}/{}", idx + 1, api_version, kind_name))?;
        let md = obj
            .get_mut("metadata")
            .and_then(|m| m.as_object_mut())
            .ok_or_else(|| anyhow!("document {}: missing metadata", idx + 1))?;
        md.entry("namespace").or_insert_with(|| Json::String(default_ns.to_string()));
        out.push((kind, obj));
    }
    Ok(out)
}

/// Remove server-assigned fields that would only add noise to the output.
fn strip_noisy(mut v: Json) -> Json {
    if let Some(md) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for k in ["uid", "resourceVersion", "creationTimestamp", "generation"] {
            md.remove(k);
        }
        if let Some(refs) = md.get_mut("ownerReferences").and_then(|r| r.as_array_mut()) {
            for r in refs.iter_mut().filter_map(|r| r.as_object_mut()) {
                r.remove("uid");
            }
        }
    }
    v
}

pub async fn render(text: &str, default_ns: &str, image: &str) -> Result<Vec<Json>> {
    let mem = Arc::new(MemStore::new());
    let ctx = Context::new(mem.clone(), Renderer::new(image), Settings::default());
    let mut namespaces = BTreeSet::new();
    for (kind, obj) in load(text, default_ns)? {
        if let Some(ns) = meta::namespace(&obj) {
            namespaces.insert(ns.to_string());
        }
        mem.insert(kind, obj)?;
    }
    for ns in &namespaces {
        for owner in [ObjectKind::Pipeline, ObjectKind::Deployment] {
            let selector = Default::default();
            for obj in mem.list(owner, ns, &selector).await? {
                let name = meta::name(&obj).unwrap_or_default().to_string();
                let res = match owner {
                    ObjectKind::Pipeline => reconcile_pipeline(&ctx, &obj).await.map(|_| ()),
                    _ => reconcile_deployment(&ctx, &obj).await.map(|_| ()),
                };
                match res {
                    Ok(()) => {}
                    Err(e) if e.is_permanent() => warn!(kind = %owner, ns = %ns, name = %name, error = %e, "skipped"),
                    Err(e) => bail!("{} {}/{}: {}", owner, ns, name, e),
                }
            }
        }
    }
    let mut out = Vec::new();
    for ns in &namespaces {
        for kind in GENERATED {
            out.extend(mem.snapshot(kind, ns).into_iter().map(strip_noisy));
        }
    }
    Ok(out)
}
