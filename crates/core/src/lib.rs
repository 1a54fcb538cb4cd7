//! Logstash operator core: resource kinds, CRDs, label selectors and the store contract.

#![forbid(unsafe_code)]

pub mod element;
pub mod kinds;
pub mod meta;
pub mod resources;
pub mod selector;
pub mod store;

pub use element::Element;
pub use kinds::{ElementKind, ObjectKind};
pub use resources::{
    DeploymentSpec, DeploymentStatus, ElementStatus, FilterSpec, InputSpec, LogstashDeployment, LogstashFilter,
    LogstashInput, LogstashOutput, LogstashPipeline, OutputSpec, PipelineRef, PipelineSpec, PipelineStatus,
};
pub use store::{ArtifactStore, Json, StoreError, StoreResult};

/// API group served by the operator's CRDs.
pub const GROUP: &str = "logstash.operator.dev";
/// API version served by the operator's CRDs.
pub const VERSION: &str = "v1alpha1";

/// Annotation holding the re-reconcile trigger counter on pipelines and deployments.
pub const GENERATION_ANNOTATION: &str = "logstash.operator.dev/generation";
/// Label linking exposure artifacts back to their deployment.
pub const DEPLOYMENT_LABEL: &str = "logstash.operator.dev/deployment";
/// Label linking a pipeline artifact back to its pipeline.
pub const PIPELINE_LABEL: &str = "logstash.operator.dev/pipeline";
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "lso-operator";

/// Names of generated artifacts, derived from their owner's name.
pub mod names {
    pub fn pipeline_artifact(pipeline: &str) -> String { format!("logstash-pipeline-{}", pipeline) }
    pub fn config_artifact(deployment: &str) -> String { format!("{}-config", deployment) }
    pub fn pipelines_artifact(deployment: &str) -> String { format!("{}-pipelines", deployment) }
    pub fn workload(deployment: &str) -> String { deployment.to_string() }
    pub fn exposure(deployment: &str, input: &str) -> String { format!("{}-{}", deployment, input) }
}

/// 64-bit FNV-1a over the given parts, each terminated by a NUL so `["ab","c"]` and `["a","bc"]` differ.
pub fn fingerprint<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    let mut h: u64 = 0xcbf29ce484222325; // 64-bit FNV-1a offset
    for part in parts {
        for b in part.as_bytes().iter().chain(std::iter::once(&0u8)) {
            h ^= *b as u64;
            h = h.wrapping_mul(0x100000001b3);
        }
    }
    format!("{:016x}", h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_separates_parts() {
        assert_eq!(fingerprint(["a", "b"]), fingerprint(["a", "b"]));
        assert_ne!(fingerprint(["ab", "c"]), fingerprint(["a", "bc"]));
        assert_eq!(fingerprint(Vec::<&str>::new()).len(), 16);
    }

    #[test]
    fn artifact_names_follow_owner() {
        assert_eq!(names::pipeline_artifact("main"), "logstash-pipeline-main");
        assert_eq!(names::exposure("ls", "beats"), "ls-beats");
        assert_eq!(names::config_artifact("ls"), "ls-config");
        assert_eq!(names::pipelines_artifact("ls"), "ls-pipelines");
    }
}
