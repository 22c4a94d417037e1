//! Kinformer core types: unstructured resources, identity, and shared helpers

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

pub mod addressing;
mod collection;
mod error;
pub mod image;
pub mod time;
pub mod units;

pub use collection::{reconcile, Identified, ListMeta, UnstructuredList};
pub use error::{Error, Result};

pub type Labels = BTreeMap<String, String>;

/// Maps an explicit JSON `null` to the type's default instead of failing.
pub(crate) fn null_default<'de, D, T>(d: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<Labels>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<String>,
    /// Derived by the relation plugin; never sent back to the backend.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relations: Option<Vec<Relation>>,
    /// uid, creationTimestamp, ownerReferences, managedFields, ...
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A resource instance of any kind. `spec`, `status` and every other top-level
/// payload key live in `body`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unstructured {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: ObjectMeta,
    /// Identity key injected by the id plugin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

impl Unstructured {
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            metadata: ObjectMeta { name: Some(name.into()), ..Default::default() },
            ..Default::default()
        }
    }

    pub fn from_value(v: Value) -> Result<Self> {
        serde_json::from_value(v).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| Error::Decode(e.to_string()))
    }

    pub fn name(&self) -> &str { self.metadata.name.as_deref().unwrap_or("") }
    pub fn namespace(&self) -> Option<&str> { self.metadata.namespace.as_deref().filter(|s| !s.is_empty()) }
    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }

    pub fn key(&self) -> ObjectKey {
        ObjectKey { namespace: self.namespace().map(str::to_string), name: self.name().to_string() }
    }

    /// `"{namespace}/{name}"`, bare `name` when cluster-scoped, or empty.
    pub fn identity(&self) -> String { addressing::compute_identity(self) }

    pub fn spec(&self) -> Option<&Value> { self.body.get("spec") }
    pub fn status(&self) -> Option<&Value> { self.body.get("status") }

    /// Look up a body field by JSON pointer, e.g. `/spec/template/spec`.
    pub fn pointer(&self, ptr: &str) -> Option<&Value> {
        let rest = ptr.strip_prefix('/')?;
        let (head, tail) = match rest.find('/') {
            Some(i) => (&rest[..i], &rest[i..]),
            None => (rest, ""),
        };
        let top = self.body.get(head)?;
        if tail.is_empty() { Some(top) } else { top.pointer(tail) }
    }

    /// Set a body field, creating intermediate objects as needed. Non-object
    /// intermediates are replaced.
    pub fn set_path(&mut self, path: &[&str], value: Value) {
        let Some((first, rest)) = path.split_first() else { return };
        if rest.is_empty() {
            self.body.insert((*first).to_string(), value);
            return;
        }
        let mut cur = self.body.entry((*first).to_string()).or_insert_with(|| Value::Object(Map::new()));
        for (i, seg) in rest.iter().enumerate() {
            if !cur.is_object() {
                *cur = Value::Object(Map::new());
            }
            let Value::Object(obj) = cur else { return };
            if i + 1 == rest.len() {
                obj.insert((*seg).to_string(), value);
                return;
            }
            cur = obj.entry((*seg).to_string()).or_insert_with(|| Value::Object(Map::new()));
        }
    }
}

/// Namespace/name pair identifying an item within one collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationType {
    Creates,
    Uses,
    Applies,
    Owner,
    Selects,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relation {
    pub kind: String,
    pub api_version: String,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    pub inbound: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
    Ping,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Bookmark => "BOOKMARK",
            EventType::Error => "ERROR",
            EventType::Ping => "PING",
        }
    }

    /// Whether the event changes collection contents.
    pub fn is_data(&self) -> bool { matches!(self, EventType::Added | EventType::Modified | EventType::Deleted) }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One decoded frame of the watch protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, deserialize_with = "null_default")]
    pub object: Unstructured,
}

impl WatchEvent {
    pub fn new(event_type: EventType, object: Unstructured) -> Self { Self { event_type, object } }
    pub fn ping() -> Self { Self { event_type: EventType::Ping, object: Unstructured::default() } }
}

pub mod prelude {
    pub use super::{
        EventType, Identified, ObjectKey, ObjectMeta, Relation, RelationType, Unstructured, UnstructuredList,
        WatchEvent,
    };
    pub use super::addressing::ResourceTarget;
    pub use super::{Error, Result};
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unstructured_keeps_unknown_fields() {
        let raw = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod", "uid": "u-1", "resourceVersion": "7" },
            "spec": { "replicas": 2 },
            "status": { "readyReplicas": 1 }
        });
        let obj = Unstructured::from_value(raw.clone()).expect("decode");
        assert_eq!(obj.identity(), "prod/web");
        assert_eq!(obj.resource_version(), Some("7"));
        assert_eq!(obj.metadata.extra.get("uid"), Some(&json!("u-1")));
        assert_eq!(obj.pointer("/spec/replicas"), Some(&json!(2)));
        assert_eq!(obj.to_value().expect("encode"), raw);
    }

    #[test]
    fn set_path_creates_intermediates() {
        let mut obj = Unstructured::new("apps/v1", "Deployment", "web");
        obj.set_path(&["spec", "template", "metadata", "annotations", "a"], json!("b"));
        assert_eq!(obj.pointer("/spec/template/metadata/annotations/a"), Some(&json!("b")));
        obj.set_path(&["spec", "replicas"], json!(3));
        assert_eq!(obj.pointer("/spec/replicas"), Some(&json!(3)));
        assert!(obj.pointer("/spec/template").is_some());
    }

    #[test]
    fn ping_without_object_decodes() {
        let ev: WatchEvent = serde_json::from_str(r#"{"type":"PING"}"#).expect("ping");
        assert_eq!(ev.event_type, EventType::Ping);
        let ev: WatchEvent = serde_json::from_str(r#"{"type":"PING","object":null}"#).expect("ping null");
        assert_eq!(ev, WatchEvent::ping());
    }

    #[test]
    fn relation_serializes_lowercase_type() {
        let rel = Relation {
            kind: "Pod".into(),
            api_version: "v1".into(),
            relation_type: RelationType::Selects,
            inbound: false,
            selector: None,
            name: None,
            namespace: None,
        };
        assert_eq!(
            serde_json::to_value(&rel).expect("encode"),
            json!({ "kind": "Pod", "apiVersion": "v1", "type": "selects", "inbound": false })
        );
    }
}
