#![allow(dead_code)]

use std::sync::Arc;

use lso_core::{Json, ObjectKind};
use lso_reconcile::{Context, Settings};
use lso_render::Renderer;
use lso_store::MemStore;
use serde_json::json;

pub const NS: &str = "logs";

pub fn setup() -> (Arc<MemStore>, Context) {
    setup_with(Settings::default())
}

pub fn setup_with(settings: Settings) -> (Arc<MemStore>, Context) {
    let mem = Arc::new(MemStore::new());
    let ctx = Context::new(mem.clone(), Renderer::new("logstash:test"), settings);
    (mem, ctx)
}

fn meta(name: &str, labels: &[(&str, &str)]) -> Json {
    let labels: serde_json::Map<String, Json> = labels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    json!({ "name": name, "namespace": NS, "labels": labels })
}

pub fn filter(name: &str, order: i64, config: &str, labels: &[(&str, &str)]) -> Json {
    json!({ "metadata": meta(name, labels), "spec": { "config": config, "order": order } })
}

pub fn input(name: &str, port: Option<i32>, config: &str, labels: &[(&str, &str)]) -> Json {
    json!({ "metadata": meta(name, labels), "spec": { "config": config, "port": port } })
}

pub fn output(name: &str, config: &str, labels: &[(&str, &str)]) -> Json {
    json!({ "metadata": meta(name, labels), "spec": { "config": config } })
}

pub fn pipeline(name: &str, match_labels: &[(&str, &str)]) -> Json {
    let ml: serde_json::Map<String, Json> = match_labels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
    json!({ "metadata": meta(name, &[]), "spec": { "selector": { "matchLabels": ml } } })
}

pub fn deployment(name: &str, replicas: Option<i32>, pipelines: &[&str], input_labels: Option<&[(&str, &str)]>) -> Json {
    let pipelines: Vec<Json> = pipelines.iter().map(|p| json!({ "name": p })).collect();
    let mut spec = json!({ "replicas": replicas, "pipelines": pipelines, "config": "pipeline.ecs_compatibility: disabled\n" });
    if let Some(labels) = input_labels {
        let ml: serde_json::Map<String, Json> = labels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
        spec["selector"] = json!({ "matchLabels": ml });
    }
    json!({ "metadata": meta(name, &[]), "spec": spec })
}

/// Insert and return the stored object (with uid and resourceVersion).
pub fn seed(mem: &MemStore, kind: ObjectKind, body: Json) -> Json {
    mem.insert(kind, body).expect("seed")
}

/// Current stored state of an object.
pub fn live(mem: &MemStore, kind: ObjectKind, name: &str) -> Json {
    mem.peek(kind, NS, name).unwrap_or_else(|| panic!("{} {} missing", kind, name))
}
