//! Artifact rendering: `render(template, params) -> body`.
//!
//! Bodies are plain JSON checked against the matching k8s-openapi type before they are handed out, so
//! a template bug surfaces here instead of as a 422 from the API server.

#![forbid(unsafe_code)]

use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{ConfigMap, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use lso_core::{Json, DEPLOYMENT_LABEL, MANAGED_BY, MANAGED_BY_LABEL, PIPELINE_LABEL};
use serde::{Deserialize, Serialize};
use serde_json::json;

pub type Params = serde_json::Map<String, Json>;

pub const DEFAULT_IMAGE: &str = "docker.elastic.co/logstash/logstash:8.13.4";
const PIPELINE_ROOT: &str = "/usr/share/logstash/pipeline";
const CONFIG_ROOT: &str = "/usr/share/logstash/config";
const DEFAULT_ENGINE_CONFIG: &str = "http.host: \"0.0.0.0\"\n";
/// Pod template annotation carrying the engine config fingerprint; a change rolls the pods.
pub const CONFIG_HASH_ANNOTATION: &str = "logstash.operator.dev/config-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Template {
    /// Pipeline composite: one ConfigMap key per block.
    PipelineArtifact,
    /// `logstash.yml` ConfigMap.
    EngineConfig,
    /// `pipelines.yml` ConfigMap.
    PipelineLocations,
    /// StatefulSet running Logstash.
    Workload,
    /// Service exposing one input port.
    Exposure,
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Template::PipelineArtifact => "pipeline-artifact",
            Template::EngineConfig => "engine-config",
            Template::PipelineLocations => "pipeline-locations",
            Template::Workload => "workload",
            Template::Exposure => "exposure",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("{template}: missing parameter `{param}`")]
    MissingParam { template: Template, param: &'static str },
    #[error("{template}: parameter `{param}` has the wrong type")]
    InvalidParam { template: Template, param: &'static str },
    #[error("{template}: rendered body is not a valid object: {message}")]
    Invalid { template: Template, message: String },
}

/// Pipeline reference as accepted by the location and workload templates.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineParam {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
}

/// One exposed input port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortParam {
    pub name: String,
    pub port: i32,
}

#[derive(Serialize)]
struct PipelinesYmlEntry<'a> {
    #[serde(rename = "pipeline.id")]
    id: &'a str,
    #[serde(rename = "path.config")]
    path: String,
    #[serde(rename = "pipeline.workers", skip_serializing_if = "Option::is_none")]
    workers: Option<u32>,
}

/// Turn a `json!({...})` object into render params; non-objects yield empty params.
pub fn params(v: Json) -> Params {
    match v {
        Json::Object(m) => m,
        _ => Params::new(),
    }
}

#[derive(Debug, Clone)]
pub struct Renderer {
    image: String,
}

impl Default for Renderer {
    fn default() -> Self { Self::new(DEFAULT_IMAGE) }
}

impl Renderer {
    pub fn new(image: impl Into<String>) -> Self { Self { image: image.into() } }

    pub fn image(&self) -> &str { &self.image }

    pub fn render(&self, template: Template, params: &Params) -> Result<Json, RenderError> {
        let p = P { template, params };
        let body = match template {
            Template::PipelineArtifact => {
                let data = p.opt_obj("data")?.cloned().unwrap_or_default();
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": {
                        "name": p.str("name")?,
                        "labels": { MANAGED_BY_LABEL: MANAGED_BY, PIPELINE_LABEL: p.str("pipeline")? }
                    },
                    "data": data,
                });
                check::<ConfigMap>(template, body)?
            }
            Template::EngineConfig => {
                let config = p.opt_str("config")?.filter(|s| !s.trim().is_empty()).unwrap_or(DEFAULT_ENGINE_CONFIG);
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": p.str("name")?, "labels": deployment_labels(p.str("deployment")?) },
                    "data": { "logstash.yml": config },
                });
                check::<ConfigMap>(template, body)?
            }
            Template::PipelineLocations => {
                let pipelines: Vec<PipelineParam> = p.typed("pipelines")?;
                let entries: Vec<PipelinesYmlEntry> = pipelines
                    .iter()
                    .map(|pl| PipelinesYmlEntry { id: &pl.name, path: format!("{}/{}/*.conf", PIPELINE_ROOT, pl.name), workers: pl.workers })
                    .collect();
                let yml = serde_yaml::to_string(&entries).map_err(|e| RenderError::Invalid { template, message: e.to_string() })?;
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "ConfigMap",
                    "metadata": { "name": p.str("name")?, "labels": deployment_labels(p.str("deployment")?) },
                    "data": { "pipelines.yml": yml },
                });
                check::<ConfigMap>(template, body)?
            }
            Template::Workload => self.workload(&p)?,
            Template::Exposure => {
                let deployment = p.str("deployment")?;
                let port = p.int("port")?;
                let body = json!({
                    "apiVersion": "v1",
                    "kind": "Service",
                    "metadata": {
                        "name": p.str("name")?,
                        "labels": { MANAGED_BY_LABEL: MANAGED_BY, DEPLOYMENT_LABEL: deployment, "logstash.operator.dev/input": p.str("input")? }
                    },
                    "spec": {
                        "selector": { DEPLOYMENT_LABEL: deployment },
                        "ports": [{ "name": "input", "port": port, "targetPort": port, "protocol": "TCP" }]
                    }
                });
                check::<Service>(template, body)?
            }
        };
        Ok(body)
    }

    fn workload(&self, p: &P<'_>) -> Result<Json, RenderError> {
        let name = p.str("name")?;
        let deployment = p.str("deployment")?;
        let replicas = p.int("replicas")?;
        let image = p.opt_str("image")?.unwrap_or(self.image.as_str());
        let pipelines: Vec<PipelineParam> = p.typed("pipelines")?;
        let mut ports: Vec<PortParam> = p.typed("ports")?;
        ports.sort();
        let config_artifact = p.str("config_artifact")?;
        let pipelines_artifact = p.str("pipelines_artifact")?;
        let config_hash = p.opt_str("config_hash")?.unwrap_or_default();

        let mut mounts = vec![
            json!({ "name": "config", "mountPath": format!("{}/logstash.yml", CONFIG_ROOT), "subPath": "logstash.yml" }),
            json!({ "name": "pipelines", "mountPath": format!("{}/pipelines.yml", CONFIG_ROOT), "subPath": "pipelines.yml" }),
        ];
        let mut volumes = vec![
            json!({ "name": "config", "configMap": { "name": config_artifact } }),
            json!({ "name": "pipelines", "configMap": { "name": pipelines_artifact } }),
        ];
        for pl in &pipelines {
            let vol = format!("pipeline-{}", pl.name);
            mounts.push(json!({ "name": vol, "mountPath": format!("{}/{}", PIPELINE_ROOT, pl.name) }));
            volumes.push(json!({ "name": vol, "configMap": { "name": lso_core::names::pipeline_artifact(&pl.name) } }));
        }
        let container_ports: Vec<Json> = ports.iter().map(|pp| json!({ "containerPort": pp.port, "protocol": "TCP" })).collect();

        let body = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": { "name": name, "labels": deployment_labels(deployment) },
            "spec": {
                "replicas": replicas,
                "serviceName": name,
                "selector": { "matchLabels": { DEPLOYMENT_LABEL: deployment } },
                "template": {
                    "metadata": {
                        "labels": { DEPLOYMENT_LABEL: deployment, "app.kubernetes.io/name": "logstash" },
                        "annotations": { CONFIG_HASH_ANNOTATION: config_hash }
                    },
                    "spec": {
                        "containers": [{
                            "name": "logstash",
                            "image": image,
                            "ports": container_ports,
                            "volumeMounts": mounts,
                        }],
                        "volumes": volumes,
                    }
                }
            }
        });
        check::<StatefulSet>(p.template, body)
    }
}

fn deployment_labels(deployment: &str) -> Json {
    json!({ MANAGED_BY_LABEL: MANAGED_BY, DEPLOYMENT_LABEL: deployment, "app.kubernetes.io/name": "logstash" })
}

fn check<T: serde::de::DeserializeOwned>(template: Template, body: Json) -> Result<Json, RenderError> {
    serde_json::from_value::<T>(body.clone()).map_err(|e| RenderError::Invalid { template, message: e.to_string() })?;
    Ok(body)
}

/// Attach the controlling owner reference (for garbage collection) and the managed-by label.
pub fn adopt(body: &mut Json, owner: &OwnerReference) {
    let owner_ref = serde_json::to_value(owner).unwrap_or(Json::Null);
    if let Some(md) = body.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        md.insert("ownerReferences".into(), Json::Array(vec![owner_ref]));
        let labels = md.entry("labels").or_insert_with(|| json!({}));
        if let Some(l) = labels.as_object_mut() {
            l.insert(MANAGED_BY_LABEL.into(), Json::String(MANAGED_BY.into()));
        }
    }
}

/// Typed parameter access bound to one template for error reporting.
struct P<'a> {
    template: Template,
    params: &'a Params,
}

impl<'a> P<'a> {
    fn str(&self, param: &'static str) -> Result<&'a str, RenderError> {
        self.opt_str(param)?.ok_or(RenderError::MissingParam { template: self.template, param })
    }

    fn opt_str(&self, param: &'static str) -> Result<Option<&'a str>, RenderError> {
        match self.params.get(param) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::String(s)) => Ok(Some(s.as_str())),
            Some(_) => Err(RenderError::InvalidParam { template: self.template, param }),
        }
    }

    fn int(&self, param: &'static str) -> Result<i64, RenderError> {
        match self.params.get(param) {
            None | Some(Json::Null) => Err(RenderError::MissingParam { template: self.template, param }),
            Some(v) => v.as_i64().ok_or(RenderError::InvalidParam { template: self.template, param }),
        }
    }

    fn opt_obj(&self, param: &'static str) -> Result<Option<&'a serde_json::Map<String, Json>>, RenderError> {
        match self.params.get(param) {
            None | Some(Json::Null) => Ok(None),
            Some(Json::Object(m)) => Ok(Some(m)),
            Some(_) => Err(RenderError::InvalidParam { template: self.template, param }),
        }
    }

    /// Absent list parameters read as empty.
    fn typed<T: serde::de::DeserializeOwned + Default>(&self, param: &'static str) -> Result<T, RenderError> {
        match self.params.get(param) {
            None | Some(Json::Null) => Ok(T::default()),
            Some(v) => serde_json::from_value(v.clone()).map_err(|_| RenderError::InvalidParam { template: self.template, param }),
        }
    }
}
