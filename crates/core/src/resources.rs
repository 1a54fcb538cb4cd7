//! Custom resources watched by the operator.
//!
//! Elements (filters, inputs, outputs) are authored by users; pipelines select elements by label and
//! deployments run pipelines. Schemas are not published with the CRDs: beyond required-field checks the
//! operator does not validate specs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "logstash.operator.dev",
    version = "v1alpha1",
    kind = "LogstashFilter",
    namespaced,
    status = "ElementStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    /// Body of the `filter { ... }` section.
    #[serde(default)]
    pub config: String,
    /// Position among the pipeline's filters; ties break on name.
    #[serde(default)]
    pub order: i64,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "logstash.operator.dev",
    version = "v1alpha1",
    kind = "LogstashInput",
    namespaced,
    status = "ElementStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct InputSpec {
    #[serde(default)]
    pub config: String,
    /// Port exposed through a Service by every deployment selecting this input.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "logstash.operator.dev",
    version = "v1alpha1",
    kind = "LogstashOutput",
    namespaced,
    status = "ElementStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct OutputSpec {
    #[serde(default)]
    pub config: String,
}

/// Status shared by all element kinds.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ElementStatus {
    /// Fingerprint of labels+spec whose change has been propagated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub propagated: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "logstash.operator.dev",
    version = "v1alpha1",
    kind = "LogstashPipeline",
    namespaced,
    status = "PipelineStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PipelineSpec {
    /// Selects the elements assembled into this pipeline. Empty selects every element in the namespace.
    #[serde(default)]
    pub selector: LabelSelector,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "logstash.operator.dev",
    version = "v1alpha1",
    kind = "LogstashDeployment",
    namespaced,
    status = "DeploymentStatus",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Raw `logstash.yml`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,
    #[serde(default)]
    pub pipelines: Vec<PipelineRef>,
    /// Selects the inputs exposed as Services. Absent exposes nothing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PipelineRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<u32>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatus {
    /// Workload descriptor created for this deployment; present once the create path has finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stateful_set: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Fingerprint of everything except replicas that shaped the last full apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub exposures: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deployment_spec_parses_camel_case() {
        let spec: DeploymentSpec = serde_json::from_value(serde_json::json!({
            "replicas": 2,
            "pipelines": [{"name": "main", "workers": 4}],
            "selector": {"matchLabels": {"tier": "edge"}}
        }))
        .unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.pipelines[0].workers, Some(4));
        assert_eq!(spec.selector.unwrap().match_labels.unwrap()["tier"], "edge");
    }

    #[test]
    fn status_serializes_camel_case() {
        let st = DeploymentStatus { stateful_set: Some("ls".into()), ..Default::default() };
        let v = serde_json::to_value(&st).unwrap();
        assert_eq!(v["statefulSet"], "ls");
        assert!(v.get("error").is_none());
    }
}
