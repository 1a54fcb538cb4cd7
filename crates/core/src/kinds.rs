use serde::{Deserialize, Serialize};

/// Every object kind the engine reads or writes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    Filter,
    Input,
    Output,
    Pipeline,
    Deployment,
    ConfigMap,
    StatefulSet,
    Service,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 8] = [
        ObjectKind::Filter,
        ObjectKind::Input,
        ObjectKind::Output,
        ObjectKind::Pipeline,
        ObjectKind::Deployment,
        ObjectKind::ConfigMap,
        ObjectKind::StatefulSet,
        ObjectKind::Service,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            ObjectKind::ConfigMap | ObjectKind::Service => "",
            ObjectKind::StatefulSet => "apps",
            _ => crate::GROUP,
        }
    }

    pub fn version(&self) -> &'static str {
        match self {
            ObjectKind::ConfigMap | ObjectKind::Service | ObjectKind::StatefulSet => "v1",
            _ => crate::VERSION,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ObjectKind::Filter => "LogstashFilter",
            ObjectKind::Input => "LogstashInput",
            ObjectKind::Output => "LogstashOutput",
            ObjectKind::Pipeline => "LogstashPipeline",
            ObjectKind::Deployment => "LogstashDeployment",
            ObjectKind::ConfigMap => "ConfigMap",
            ObjectKind::StatefulSet => "StatefulSet",
            ObjectKind::Service => "Service",
        }
    }

    pub fn plural(&self) -> &'static str {
        match self {
            ObjectKind::Filter => "logstashfilters",
            ObjectKind::Input => "logstashinputs",
            ObjectKind::Output => "logstashoutputs",
            ObjectKind::Pipeline => "logstashpipelines",
            ObjectKind::Deployment => "logstashdeployments",
            ObjectKind::ConfigMap => "configmaps",
            ObjectKind::StatefulSet => "statefulsets",
            ObjectKind::Service => "services",
        }
    }

    pub fn api_version(&self) -> String {
        if self.group().is_empty() { self.version().to_string() } else { format!("{}/{}", self.group(), self.version()) }
    }

    /// Resolve from the `apiVersion`/`kind` pair found on a manifest.
    pub fn from_type_meta(api_version: &str, kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.kind() == kind && k.api_version() == api_version)
    }
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.kind()) }
}

/// Kinds of configuration fragments a pipeline is assembled from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    Filter,
    Input,
    Output,
}

impl ElementKind {
    pub const ALL: [ElementKind; 3] = [ElementKind::Filter, ElementKind::Input, ElementKind::Output];

    pub fn object_kind(&self) -> ObjectKind {
        match self {
            ElementKind::Filter => ObjectKind::Filter,
            ElementKind::Input => ObjectKind::Input,
            ElementKind::Output => ObjectKind::Output,
        }
    }

    /// Logstash section keyword wrapping this kind's configuration.
    pub fn section(&self) -> &'static str {
        match self {
            ElementKind::Filter => "filter",
            ElementKind::Input => "input",
            ElementKind::Output => "output",
        }
    }

    /// Single aggregate key for kinds concatenated into one block; `None` for per-element kinds.
    pub fn aggregate_key(&self) -> Option<&'static str> {
        match self {
            ElementKind::Filter => None,
            ElementKind::Input => Some("input.conf"),
            ElementKind::Output => Some("output.conf"),
        }
    }

    /// Whether an artifact key was produced by assembling this kind.
    pub fn owns_key(&self, key: &str) -> bool {
        match self.aggregate_key() {
            Some(agg) => key == agg,
            None => ElementKind::ALL.iter().all(|k| k.aggregate_key() != Some(key)),
        }
    }
}

impl std::fmt::Display for ElementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.section()) }
}
