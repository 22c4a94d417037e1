use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kinformer_core::{Relation, RelationType, Result, Unstructured};
use serde_json::{Map, Value};
use tracing::debug;

use crate::{Item, Plugin};

const SELECTOR_KINDS: [&str; 6] = ["Deployment", "DaemonSet", "StatefulSet", "ReplicaSet", "Job", "Service"];

/// Infers the pods a controller or service targets from `spec.selector`.
///
/// Shorthand selectors (`{app: x}` as used by Service) are rewritten to
/// `matchLabels` in place; that rewrite is kept on restore.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelationPlugin;

impl RelationPlugin {
    fn infer(&self, raw: &mut Unstructured) {
        if !SELECTOR_KINDS.contains(&raw.kind.as_str()) {
            return;
        }
        let Some(Value::Object(spec)) = raw.body.get_mut("spec") else { return };
        let Some(Value::Object(selector)) = spec.get_mut("selector") else { return };
        normalize_selector(selector);

        let parsed: LabelSelector = match serde_json::from_value(Value::Object(selector.clone())) {
            Ok(s) => s,
            Err(e) => {
                debug!(kind = %raw.kind, name = %raw.name(), error = %e, "unparseable selector");
                return;
            }
        };
        let relation = Relation {
            kind: "Pod".into(),
            api_version: "v1".into(),
            relation_type: if raw.kind == "Service" { RelationType::Selects } else { RelationType::Creates },
            inbound: false,
            selector: Some(parsed),
            name: None,
            namespace: None,
        };
        let relations = raw.metadata.relations.get_or_insert_with(Vec::new);
        if !relations.contains(&relation) {
            relations.push(relation);
        }
    }
}

/// Moves bare `key: value` pairs under `matchLabels` when neither
/// `matchLabels` nor `matchExpressions` is present.
fn normalize_selector(selector: &mut Map<String, Value>) {
    if selector.contains_key("matchLabels") || selector.contains_key("matchExpressions") {
        return;
    }
    let labels: Map<String, Value> = std::mem::take(selector)
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            };
            (k, v)
        })
        .collect();
    selector.insert("matchLabels".into(), Value::Object(labels));
}

#[async_trait]
impl Plugin for RelationPlugin {
    fn name(&self) -> &'static str { "relation" }

    async fn process_item(&self, item: Item) -> Result<Item> {
        Ok(match item {
            Item::Raw(mut raw) => {
                self.infer(&mut raw);
                Item::Raw(raw)
            }
            other => other,
        })
    }

    fn restore_item(&self, item: Item) -> Item {
        let mut raw = item.into_raw();
        raw.metadata.relations = None;
        Item::Raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkloadModel;
    use crate::Model;
    use serde_json::json;

    fn raw(v: Value) -> Unstructured { Unstructured::from_value(v).expect("decode") }

    #[tokio::test]
    async fn deployment_creates_pods() {
        let d = raw(json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "x", "namespace": "ns" },
            "spec": { "selector": { "matchLabels": { "app": "x" } } }
        }));
        let out = RelationPlugin.process_item(Item::Raw(d.clone())).await.expect("process").into_raw();
        let rels = serde_json::to_value(&out.metadata.relations).expect("encode");
        assert_eq!(
            rels,
            json!([{ "kind": "Pod", "apiVersion": "v1", "type": "creates", "selector": { "matchLabels": { "app": "x" } }, "inbound": false }])
        );
        assert_eq!(RelationPlugin.restore_item(Item::Raw(out)).into_raw(), d);
    }

    #[tokio::test]
    async fn relations_are_stripped_from_models() {
        let d = raw(json!({
            "apiVersion": "apps/v1", "kind": "StatefulSet",
            "metadata": { "name": "db", "namespace": "ns" },
            "spec": { "selector": { "matchLabels": { "app": "db" } } }
        }));
        let out = RelationPlugin.process_item(Item::Raw(d.clone())).await.expect("process").into_raw();
        let model = Item::Model(Model::Workload(WorkloadModel::new(out)));
        assert_eq!(RelationPlugin.restore_item(model), Item::Raw(d));
    }

    #[tokio::test]
    async fn service_shorthand_is_normalized_one_way() {
        let svc = raw(json!({
            "apiVersion": "v1", "kind": "Service",
            "metadata": { "name": "s", "namespace": "ns" },
            "spec": { "selector": { "app": "x", "tier": "web" } }
        }));
        let out = RelationPlugin.process_item(Item::Raw(svc)).await.expect("process").into_raw();
        let rel = &out.metadata.relations.as_ref().expect("relations")[0];
        assert_eq!(rel.relation_type, RelationType::Selects);
        let labels = rel.selector.as_ref().and_then(|s| s.match_labels.clone()).expect("labels");
        assert_eq!(labels.get("tier").map(String::as_str), Some("web"));

        let restored = RelationPlugin.restore_item(Item::Raw(out)).into_raw();
        assert!(restored.metadata.relations.is_none());
        assert_eq!(restored.pointer("/spec/selector"), Some(&json!({ "matchLabels": { "app": "x", "tier": "web" } })));
    }

    #[tokio::test]
    async fn ignores_other_kinds_and_missing_selectors() {
        let pod = raw(json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" }, "spec": { "selector": { "a": "b" } } }));
        let out = RelationPlugin.process_item(Item::Raw(pod.clone())).await.expect("process").into_raw();
        assert_eq!(out, pod);
        let ext = raw(json!({ "apiVersion": "v1", "kind": "Service", "metadata": { "name": "e" }, "spec": { "type": "ExternalName" } }));
        let out = RelationPlugin.process_item(Item::Raw(ext.clone())).await.expect("process").into_raw();
        assert_eq!(out, ext);
    }

    #[tokio::test]
    async fn processing_twice_does_not_duplicate() {
        let d = raw(json!({
            "apiVersion": "apps/v1", "kind": "ReplicaSet", "metadata": { "name": "r" },
            "spec": { "selector": { "matchExpressions": [{ "key": "app", "operator": "Exists" }] } }
        }));
        let once = RelationPlugin.process_item(Item::Raw(d)).await.expect("once");
        let twice = RelationPlugin.process_item(once.clone()).await.expect("twice");
        assert_eq!(once, twice);
    }
}
