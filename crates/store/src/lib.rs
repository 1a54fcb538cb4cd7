//! In-RAM object store.
//!
//! Behaves like the parts of the API server the engine relies on: resource versions with conflict
//! detection on patches that carry one, a separate status subresource, label-selector listing and
//! cascading deletion through owner references. Every call is recorded so tests can assert on what
//! was written.

#![forbid(unsafe_code)]

use std::sync::{Mutex, MutexGuard};

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lso_core::{meta, selector, ArtifactStore, Json, ObjectKind, StoreError, StoreResult};
use rustc_hash::FxHashMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Patch,
    PatchStatus,
    Delete,
    List,
}

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Op {
    pub verb: Verb,
    pub kind: ObjectKind,
    pub namespace: String,
    /// Empty for `List`.
    pub name: String,
}

struct Fault {
    verb: Verb,
    kind: ObjectKind,
    name: Option<String>,
    error: StoreError,
}

type Key = (ObjectKind, String, String);

#[derive(Default)]
struct Inner {
    objects: FxHashMap<Key, Json>,
    next_rv: u64,
    ops: Vec<Op>,
    faults: Vec<Fault>,
}

impl Inner {
    fn bump_rv(&mut self) -> String {
        self.next_rv += 1;
        self.next_rv.to_string()
    }

    fn record(&mut self, verb: Verb, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()> {
        self.ops.push(Op { verb, kind, namespace: namespace.to_string(), name: name.to_string() });
        let hit = self.faults.iter().position(|f| {
            f.verb == verb && f.kind == kind && f.name.as_deref().map(|n| n == name).unwrap_or(true)
        });
        match hit {
            Some(idx) => Err(self.faults.remove(idx).error),
            None => Ok(()),
        }
    }
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object, replacing any existing one with the same identity. Not recorded.
    pub fn insert(&self, kind: ObjectKind, body: Json) -> StoreResult<Json> {
        let mut inner = self.lock();
        let obj = prepare_new(&mut inner, kind, None, body)?;
        let key = key_of(kind, &obj)?;
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    /// Make the next matching call fail with `error`. `name = None` matches any object.
    pub fn fail_next(&self, verb: Verb, kind: ObjectKind, name: Option<&str>, error: StoreError) {
        self.lock().faults.push(Fault { verb, kind, name: name.map(|s| s.to_string()), error });
    }

    pub fn ops(&self) -> Vec<Op> { self.lock().ops.clone() }

    pub fn clear_ops(&self) { self.lock().ops.clear(); }

    /// Recorded mutating calls (everything except get/list).
    pub fn writes(&self) -> Vec<Op> {
        self.ops().into_iter().filter(|o| !matches!(o.verb, Verb::Get | Verb::List)).collect()
    }

    pub fn snapshot(&self, kind: ObjectKind, namespace: &str) -> Vec<Json> {
        let inner = self.lock();
        let mut out: Vec<Json> = inner
            .objects
            .iter()
            .filter(|((k, ns, _), _)| *k == kind && ns == namespace)
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| meta::name(a).cmp(&meta::name(b)));
        out
    }

    pub fn peek(&self, kind: ObjectKind, namespace: &str, name: &str) -> Option<Json> {
        self.lock().objects.get(&(kind, namespace.to_string(), name.to_string())).cloned()
    }
}

fn key_of(kind: ObjectKind, obj: &Json) -> StoreResult<Key> {
    let name = meta::name(obj).ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?;
    let ns = meta::namespace(obj).unwrap_or_default();
    Ok((kind, ns.to_string(), name.to_string()))
}

fn prepare_new(inner: &mut Inner, kind: ObjectKind, namespace: Option<&str>, mut body: Json) -> StoreResult<Json> {
    let rv = inner.bump_rv();
    let obj = body.as_object_mut().ok_or_else(|| StoreError::Invalid("body must be an object".into()))?;
    obj.entry("apiVersion").or_insert_with(|| Json::String(kind.api_version()));
    obj.entry("kind").or_insert_with(|| Json::String(kind.kind().to_string()));
    let md = obj
        .entry("metadata")
        .or_insert_with(|| Json::Object(Default::default()))
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("metadata must be an object".into()))?;
    if !md.contains_key("name") {
        return Err(StoreError::Invalid("object missing metadata.name".into()));
    }
    if let Some(ns) = namespace {
        md.insert("namespace".into(), Json::String(ns.to_string()));
    }
    md.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
    md.entry("creationTimestamp").or_insert_with(|| Json::String(chrono::Utc::now().to_rfc3339()));
    md.insert("resourceVersion".into(), Json::String(rv));
    md.insert("generation".into(), Json::from(1));
    Ok(body)
}

/// RFC 7386 JSON merge patch: objects merge recursively, `null` removes, anything else replaces.
pub fn merge_patch(target: &mut Json, patch: &Json) {
    match patch {
        Json::Object(pm) => {
            if !target.is_object() {
                *target = Json::Object(Default::default());
            }
            if let Some(tm) = target.as_object_mut() {
                for (k, pv) in pm {
                    if pv.is_null() {
                        tm.remove(k);
                    } else {
                        merge_patch(tm.entry(k.clone()).or_insert(Json::Null), pv);
                    }
                }
            }
        }
        other => *target = other.clone(),
    }
}

/// Extract a precondition resourceVersion from a patch, returning the patch without it.
fn split_precondition(patch: &Json) -> (Option<String>, Json) {
    let mut p = patch.clone();
    let rv = p
        .get_mut("metadata")
        .and_then(|m| m.as_object_mut())
        .and_then(|m| m.remove("resourceVersion"))
        .and_then(|v| v.as_str().map(|s| s.to_string()));
    (rv, p)
}

fn apply_patch(inner: &mut Inner, kind: ObjectKind, namespace: &str, name: &str, patch: &Json, status: bool) -> StoreResult<Json> {
    let key = (kind, namespace.to_string(), name.to_string());
    let (precondition, mut patch) = split_precondition(patch);
    let current = inner.objects.get(&key).cloned().ok_or_else(|| StoreError::not_found(kind, namespace, name))?;
    if let Some(expected) = precondition {
        let live = meta::resource_version(&current).unwrap_or_default();
        if live != expected {
            return Err(StoreError::conflict(kind, namespace, name, format!("resourceVersion {} is stale (live {})", expected, live)));
        }
    }
    let mut next = current.clone();
    if let Some(obj) = patch.as_object_mut() {
        if status {
            let st = obj.remove("status");
            obj.clear();
            if let Some(st) = st {
                obj.insert("status".into(), st);
            }
        } else {
            obj.remove("status");
        }
    }
    merge_patch(&mut next, &patch);
    if !status && current.get("spec") != next.get("spec") {
        let g = next["metadata"]["generation"].as_i64().unwrap_or(1) + 1;
        next["metadata"]["generation"] = Json::from(g);
    }
    if next != current {
        next["metadata"]["resourceVersion"] = Json::String(inner.bump_rv());
    }
    inner.objects.insert(key, next.clone());
    Ok(next)
}

/// Remove objects whose owner references point at a removed uid, transitively.
fn collect_garbage(inner: &mut Inner, mut removed: Vec<String>) {
    while let Some(uid) = removed.pop() {
        let owned: Vec<Key> = inner
            .objects
            .iter()
            .filter(|(_, v)| {
                v.get("metadata")
                    .and_then(|m| m.get("ownerReferences"))
                    .and_then(|o| o.as_array())
                    .map(|refs| refs.iter().any(|r| r.get("uid").and_then(|u| u.as_str()) == Some(uid.as_str())))
                    .unwrap_or(false)
            })
            .map(|(k, _)| k.clone())
            .collect();
        for k in owned {
            if let Some(obj) = inner.objects.remove(&k) {
                debug!(kind = %k.0, ns = %k.1, name = %k.2, "collected owned object");
                if let Some(u) = meta::uid(&obj) {
                    removed.push(u.to_string());
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for MemStore {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json> {
        let mut inner = self.lock();
        inner.record(Verb::Get, kind, namespace, name)?;
        inner
            .objects
            .get(&(kind, namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))
    }

    async fn create(&self, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json> {
        let name = meta::name(body).ok_or_else(|| StoreError::Invalid("object missing metadata.name".into()))?.to_string();
        let mut inner = self.lock();
        inner.record(Verb::Create, kind, namespace, &name)?;
        let key = (kind, namespace.to_string(), name.clone());
        if inner.objects.contains_key(&key) {
            return Err(StoreError::already_exists(kind, namespace, &name));
        }
        let obj = prepare_new(&mut inner, kind, Some(namespace), body.clone())?;
        debug!(kind = %kind, ns = %namespace, name = %name, "created");
        inner.objects.insert(key, obj.clone());
        Ok(obj)
    }

    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json> {
        let mut inner = self.lock();
        inner.record(Verb::Patch, kind, namespace, name)?;
        apply_patch(&mut inner, kind, namespace, name, patch, false)
    }

    async fn patch_status(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json> {
        let mut inner = self.lock();
        inner.record(Verb::PatchStatus, kind, namespace, name)?;
        apply_patch(&mut inner, kind, namespace, name, patch, true)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()> {
        let mut inner = self.lock();
        inner.record(Verb::Delete, kind, namespace, name)?;
        let obj = inner
            .objects
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::not_found(kind, namespace, name))?;
        if let Some(uid) = meta::uid(&obj) {
            collect_garbage(&mut inner, vec![uid.to_string()]);
        }
        Ok(())
    }

    async fn list(&self, kind: ObjectKind, namespace: &str, sel: &LabelSelector) -> StoreResult<Vec<Json>> {
        let mut inner = self.lock();
        inner.record(Verb::List, kind, namespace, "")?;
        let mut out: Vec<Json> = inner
            .objects
            .iter()
            .filter(|((k, ns, _), v)| *k == kind && ns == namespace && selector::matches(sel, &meta::labels(v)))
            .map(|(_, v)| v.clone())
            .collect();
        out.sort_by(|a, b| meta::name(a).cmp(&meta::name(b)));
        Ok(out)
    }
}
