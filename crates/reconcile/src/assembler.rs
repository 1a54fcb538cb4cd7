//! Element assembly: selector-matched elements rendered into ordered, keyed config blocks.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use lso_core::{ArtifactStore, Element, ElementKind, StoreResult};
use tracing::{debug, warn};

/// Ordered `(key, block)` pairs. Order is the assembly order; keys are unique.
pub type Blocks = Vec<(String, String)>;

fn wrap(kind: ElementKind, body: &str) -> String { format!("{} {{\n{}\n}}", kind.section(), body) }

/// Assemble already-resolved elements. Elements of other kinds are ignored.
///
/// Filters yield one `"{order}-{name}.conf"` block each, ordered by `(order, name)`. Inputs and
/// outputs yield exactly one aggregate block, present even when nothing matched.
pub fn assemble_elements(kind: ElementKind, elements: &[Element]) -> Blocks {
    let mut matched: Vec<&Element> = elements.iter().filter(|e| e.kind == kind).collect();
    match kind.aggregate_key() {
        None => {
            matched.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.name.cmp(&b.name)));
            matched.into_iter().map(|e| (e.filter_key(), wrap(kind, &e.config))).collect()
        }
        Some(key) => {
            matched.sort_by(|a, b| a.name.cmp(&b.name));
            let body = matched.iter().map(|e| e.config.as_str()).collect::<Vec<_>>().join("\n");
            vec![(key.to_string(), wrap(kind, &body))]
        }
    }
}

/// Resolve the elements of `kind` in `namespace` matching `selector` and assemble them.
pub async fn assemble(store: &dyn ArtifactStore, namespace: &str, selector: &LabelSelector, kind: ElementKind) -> StoreResult<Blocks> {
    let objects = store.list(kind.object_kind(), namespace, selector).await?;
    let mut elements = Vec::with_capacity(objects.len());
    for obj in &objects {
        match Element::from_object(kind, obj) {
            // Rejected elements carry their error on their own status and stay out of the artifact
            Ok(e) => match e.validate() {
                Ok(()) => elements.push(e),
                Err(msg) => warn!(kind = %kind, ns = %namespace, name = %e.name, error = %msg, "skipping invalid element"),
            },
            // One malformed element must not take the whole pipeline down
            Err(e) => warn!(kind = %kind, ns = %namespace, error = %e, "skipping unparsable element"),
        }
    }
    let blocks = assemble_elements(kind, &elements);
    debug!(kind = %kind, ns = %namespace, elements = elements.len(), blocks = blocks.len(), "assembled");
    Ok(blocks)
}

/// Filters, then input, then output.
pub async fn assemble_all(store: &dyn ArtifactStore, namespace: &str, selector: &LabelSelector) -> StoreResult<Blocks> {
    let mut out = Blocks::new();
    for kind in ElementKind::ALL {
        out.extend(assemble(store, namespace, selector, kind).await?);
    }
    Ok(out)
}
