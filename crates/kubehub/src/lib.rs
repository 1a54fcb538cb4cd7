//! Kubernetes integration: the API-server-backed [`ArtifactStore`] and element watchers.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use lso_core::{selector, ArtifactStore, Json, ObjectKind, StoreError, StoreResult};
use tracing::debug;

pub mod watch;

pub use watch::{spawn_element_watchers, watch_elements, ElementDelivery};

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from kubeconfig or in-cluster environment")
}

/// Fixed resource coordinates for every kind the operator touches; no discovery round-trip needed.
pub fn api_resource(kind: ObjectKind) -> ApiResource {
    ApiResource {
        group: kind.group().to_string(),
        version: kind.version().to_string(),
        api_version: kind.api_version(),
        kind: kind.kind().to_string(),
        plural: kind.plural().to_string(),
    }
}

pub(crate) fn strip_managed_fields(v: &mut Json) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub(crate) fn to_json(obj: &DynamicObject) -> StoreResult<Json> {
    let mut raw = serde_json::to_value(obj).map_err(|e| StoreError::Backend(format!("serializing object: {}", e)))?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// Translate API errors into the store's vocabulary. 409 is split on the status reason because the
/// server uses it both for duplicate creates and for stale resourceVersions.
fn store_error(kind: ObjectKind, namespace: &str, name: &str, err: kube::Error) -> StoreError {
    match &err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::not_found(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => StoreError::already_exists(kind, namespace, name),
        kube::Error::Api(ae) if ae.code == 409 => StoreError::conflict(kind, namespace, name, ae.message.clone()),
        kube::Error::Api(ae) if ae.code == 400 || ae.code == 422 => StoreError::Invalid(ae.message.clone()),
        _ => StoreError::Backend(err.to_string()),
    }
}

/// Store backed by the API server. Status writes go through the status subresource.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    field_manager: String,
}

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client, field_manager: lso_core::MANAGED_BY.to_string() }
    }

    fn api(&self, kind: ObjectKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.client.clone(), namespace, &api_resource(kind))
    }

    fn patch_params(&self) -> PatchParams {
        PatchParams { field_manager: Some(self.field_manager.clone()), ..Default::default() }
    }
}

#[async_trait::async_trait]
impl ArtifactStore for KubeStore {
    async fn get(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<Json> {
        let obj = self.api(kind, namespace).get(name).await.map_err(|e| store_error(kind, namespace, name, e))?;
        to_json(&obj)
    }

    async fn create(&self, kind: ObjectKind, namespace: &str, body: &Json) -> StoreResult<Json> {
        let name = lso_core::meta::name(body).unwrap_or_default().to_string();
        let obj: DynamicObject =
            serde_json::from_value(body.clone()).map_err(|e| StoreError::Invalid(format!("{} {}: {}", kind, name, e)))?;
        let pp = PostParams { field_manager: Some(self.field_manager.clone()), ..Default::default() };
        let created = self.api(kind, namespace).create(&pp, &obj).await.map_err(|e| store_error(kind, namespace, &name, e))?;
        debug!(kind = %kind, ns = %namespace, name = %name, "created");
        to_json(&created)
    }

    async fn patch(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json> {
        let obj = self
            .api(kind, namespace)
            .patch(name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| store_error(kind, namespace, name, e))?;
        to_json(&obj)
    }

    async fn patch_status(&self, kind: ObjectKind, namespace: &str, name: &str, patch: &Json) -> StoreResult<Json> {
        let obj = self
            .api(kind, namespace)
            .patch_status(name, &self.patch_params(), &Patch::Merge(patch))
            .await
            .map_err(|e| store_error(kind, namespace, name, e))?;
        to_json(&obj)
    }

    async fn delete(&self, kind: ObjectKind, namespace: &str, name: &str) -> StoreResult<()> {
        self.api(kind, namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| store_error(kind, namespace, name, e))?;
        Ok(())
    }

    async fn list(&self, kind: ObjectKind, namespace: &str, sel: &LabelSelector) -> StoreResult<Vec<Json>> {
        let query = selector::to_query(sel);
        let mut lp = ListParams::default();
        if !query.is_empty() {
            lp = lp.labels(&query);
        }
        let list = self.api(kind, namespace).list(&lp).await.map_err(|e| store_error(kind, namespace, "", e))?;
        let mut out = list.items.iter().map(to_json).collect::<StoreResult<Vec<_>>>()?;
        out.sort_by(|a, b| lso_core::meta::name(a).cmp(&lso_core::meta::name(b)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_err(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse { status: "Failure".into(), message: format!("{} happened", reason), reason: reason.into(), code })
    }

    #[test]
    fn api_errors_map_to_store_errors() {
        let k = ObjectKind::ConfigMap;
        assert!(store_error(k, "ns", "x", api_err(404, "NotFound")).is_not_found());
        assert!(store_error(k, "ns", "x", api_err(409, "AlreadyExists")).is_already_exists());
        assert!(store_error(k, "ns", "x", api_err(409, "Conflict")).is_conflict());
        assert!(matches!(store_error(k, "ns", "x", api_err(422, "Invalid")), StoreError::Invalid(_)));
        assert!(matches!(store_error(k, "ns", "x", api_err(500, "InternalError")), StoreError::Backend(_)));
    }

    #[test]
    fn api_resource_uses_crd_coordinates() {
        let ar = api_resource(ObjectKind::Pipeline);
        assert_eq!(ar.group, lso_core::GROUP);
        assert_eq!(ar.api_version, format!("{}/{}", lso_core::GROUP, lso_core::VERSION));
        assert_eq!(ar.plural, "logstashpipelines");
        let core = api_resource(ObjectKind::ConfigMap);
        assert_eq!(core.group, "");
        assert_eq!(core.api_version, "v1");
    }

    #[test]
    fn managed_fields_are_dropped() {
        let mut v = serde_json::json!({"metadata": {"name": "x", "managedFields": [{"manager": "kubectl"}]}});
        strip_managed_fields(&mut v);
        assert_eq!(v, serde_json::json!({"metadata": {"name": "x"}}));
    }
}
