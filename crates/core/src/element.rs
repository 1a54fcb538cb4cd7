use std::collections::BTreeMap;

use serde::de::DeserializeOwned;

use crate::{meta, ElementKind, FilterSpec, InputSpec, Json, OutputSpec, StoreError};

/// Kind-agnostic view of a filter, input or output resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    pub kind: ElementKind,
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub config: String,
    /// Filters only; 0 for other kinds.
    pub order: i64,
    /// Inputs only.
    pub port: Option<i32>,
}

fn spec_of<T: DeserializeOwned>(obj: &Json) -> Result<T, StoreError> {
    let spec = obj.get("spec").cloned().unwrap_or_else(|| serde_json::json!({}));
    serde_json::from_value(spec).map_err(|e| StoreError::Invalid(format!("element spec: {}", e)))
}

impl Element {
    pub fn from_object(kind: ElementKind, obj: &Json) -> Result<Self, StoreError> {
        let name = meta::name(obj).ok_or_else(|| StoreError::Invalid("element missing metadata.name".into()))?.to_string();
        let namespace = meta::namespace(obj).unwrap_or_default().to_string();
        let labels = meta::labels(obj);
        let (config, order, port) = match kind {
            ElementKind::Filter => {
                let s: FilterSpec = spec_of(obj)?;
                (s.config, s.order, None)
            }
            ElementKind::Input => {
                let s: InputSpec = spec_of(obj)?;
                (s.config, 0, s.port)
            }
            ElementKind::Output => {
                let s: OutputSpec = spec_of(obj)?;
                (s.config, 0, None)
            }
        };
        Ok(Self { kind, name, namespace, labels, config, order, port })
    }

    /// Required-field checks; the message is reported on the element's status.
    pub fn validate(&self) -> Result<(), String> {
        if self.config.trim().is_empty() {
            return Err(format!("{} config must be set", self.kind));
        }
        if let Some(port) = self.port {
            if !(1..=65535).contains(&port) {
                return Err(format!("input port must be within 1..=65535, got {}", port));
            }
        }
        Ok(())
    }

    /// Artifact key for a filter element.
    pub fn filter_key(&self) -> String { format!("{}-{}.conf", self.order, self.name) }

    /// Identity of everything about this element that can change pipeline membership or content.
    pub fn fingerprint(&self) -> String {
        let order = self.order.to_string();
        let port = self.port.map(|p| p.to_string()).unwrap_or_default();
        let labels: Vec<String> = self.labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        crate::fingerprint(
            [self.kind.section(), self.config.as_str(), order.as_str(), port.as_str()]
                .into_iter()
                .chain(labels.iter().map(String::as_str)),
        )
    }
}
