//! Accessors over raw JSON objects' `metadata`.

use std::collections::BTreeMap;

use crate::Json;

fn meta_str<'a>(obj: &'a Json, field: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get(field)).and_then(|v| v.as_str())
}

pub fn name(obj: &Json) -> Option<&str> { meta_str(obj, "name") }
pub fn namespace(obj: &Json) -> Option<&str> { meta_str(obj, "namespace") }
pub fn uid(obj: &Json) -> Option<&str> { meta_str(obj, "uid") }
pub fn resource_version(obj: &Json) -> Option<&str> { meta_str(obj, "resourceVersion") }

fn string_map(obj: &Json, field: &str) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get(field))
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

pub fn labels(obj: &Json) -> BTreeMap<String, String> { string_map(obj, "labels") }

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    obj.get("metadata").and_then(|m| m.get("annotations")).and_then(|a| a.get(key)).and_then(|v| v.as_str())
}

/// Current value of the generation counter annotation; absent or unparsable reads as 0.
pub fn generation_counter(obj: &Json) -> u64 {
    annotation(obj, crate::GENERATION_ANNOTATION).and_then(|s| s.trim().parse().ok()).unwrap_or(0)
}

/// String entries under `data` (ConfigMap-shaped artifacts).
pub fn data(obj: &Json) -> BTreeMap<String, String> {
    obj.get("data")
        .and_then(|v| v.as_object())
        .map(|m| m.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_common_metadata() {
        let v = serde_json::json!({
            "metadata": {
                "name": "p", "namespace": "ns", "resourceVersion": "7",
                "labels": {"a": "1"},
                "annotations": {"logstash.operator.dev/generation": "12"}
            },
            "data": {"k": "v", "n": 3}
        });
        assert_eq!(name(&v), Some("p"));
        assert_eq!(namespace(&v), Some("ns"));
        assert_eq!(resource_version(&v), Some("7"));
        assert_eq!(labels(&v).get("a").map(String::as_str), Some("1"));
        assert_eq!(generation_counter(&v), 12);
        assert_eq!(data(&v).len(), 1);
    }

    #[test]
    fn garbage_generation_reads_as_zero() {
        let v = serde_json::json!({"metadata": {"annotations": {"logstash.operator.dev/generation": "x"}}});
        assert_eq!(generation_counter(&v), 0);
        assert_eq!(generation_counter(&serde_json::json!({})), 0);
    }
}
