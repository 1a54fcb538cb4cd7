//! Label selector evaluation and rendering to the API server's query syntax.

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};

/// Whether `labels` satisfy `selector`. An empty selector matches everything.
pub fn matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    let by_labels = selector
        .match_labels
        .as_ref()
        .map(|ml| ml.iter().all(|(k, v)| labels.get(k) == Some(v)))
        .unwrap_or(true);
    by_labels
        && selector
            .match_expressions
            .as_ref()
            .map(|exprs| exprs.iter().all(|e| requirement_matches(e, labels)))
            .unwrap_or(true)
}

fn requirement_matches(req: &LabelSelectorRequirement, labels: &BTreeMap<String, String>) -> bool {
    let values = req.values.as_deref().unwrap_or(&[]);
    let cur = labels.get(&req.key);
    match req.operator.as_str() {
        "In" => cur.map(|v| values.contains(v)).unwrap_or(false),
        "NotIn" => cur.map(|v| !values.contains(v)).unwrap_or(true),
        "Exists" => cur.is_some(),
        "DoesNotExist" => cur.is_none(),
        // Unknown operators never match
        _ => false,
    }
}

/// Render as a `labelSelector` query string (`a=b,tier in (x,y),!legacy`).
pub fn to_query(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = Vec::new();
    if let Some(ml) = &selector.match_labels {
        parts.extend(ml.iter().map(|(k, v)| format!("{}={}", k, v)));
    }
    for e in selector.match_expressions.iter().flatten() {
        let values = e.values.as_deref().unwrap_or(&[]).join(",");
        match e.operator.as_str() {
            "In" => parts.push(format!("{} in ({})", e.key, values)),
            "NotIn" => parts.push(format!("{} notin ({})", e.key, values)),
            "Exists" => parts.push(e.key.clone()),
            "DoesNotExist" => parts.push(format!("!{}", e.key)),
            _ => {}
        }
    }
    parts.join(",")
}

/// Selector matching exactly the given labels.
pub fn from_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> LabelSelector {
    let ml: BTreeMap<String, String> = labels.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    LabelSelector { match_labels: Some(ml), match_expressions: None }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn expr(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.into(),
            operator: op.into(),
            values: if values.is_empty() { None } else { Some(values.iter().map(|s| s.to_string()).collect()) },
        }
    }

    #[test]
    fn empty_selector_matches_all() {
        assert!(matches(&LabelSelector::default(), &labels(&[])));
        assert!(matches(&LabelSelector::default(), &labels(&[("a", "b")])));
        assert_eq!(to_query(&LabelSelector::default()), "");
    }

    #[test]
    fn match_labels_require_all_pairs() {
        let sel = from_labels([("pipeline", "main"), ("env", "prod")]);
        assert!(matches(&sel, &labels(&[("pipeline", "main"), ("env", "prod"), ("x", "y")])));
        assert!(!matches(&sel, &labels(&[("pipeline", "main")])));
        assert!(!matches(&sel, &labels(&[("pipeline", "other"), ("env", "prod")])));
    }

    #[test]
    fn expressions_follow_kubernetes_semantics() {
        let sel = LabelSelector {
            match_labels: None,
            match_expressions: Some(vec![
                expr("tier", "In", &["edge", "core"]),
                expr("legacy", "DoesNotExist", &[]),
                expr("zone", "NotIn", &["b"]),
            ]),
        };
        assert!(matches(&sel, &labels(&[("tier", "edge")])));
        assert!(matches(&sel, &labels(&[("tier", "core"), ("zone", "a")])));
        assert!(!matches(&sel, &labels(&[("tier", "core"), ("zone", "b")])));
        assert!(!matches(&sel, &labels(&[("tier", "edge"), ("legacy", "1")])));
        assert!(!matches(&sel, &labels(&[])));
        assert_eq!(to_query(&sel), "tier in (edge,core),!legacy,zone notin (b)");
    }

    #[test]
    fn unknown_operator_never_matches() {
        let sel = LabelSelector { match_labels: None, match_expressions: Some(vec![expr("a", "Gt", &["1"])]) };
        assert!(!matches(&sel, &labels(&[("a", "2")])));
    }
}
