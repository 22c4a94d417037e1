use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{null_default, Error, EventType, ObjectKey, Result, Unstructured};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A LIST response: `{apiVersion, kind, metadata, items}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnstructuredList {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default, deserialize_with = "null_default")]
    pub metadata: ListMeta,
    #[serde(default, deserialize_with = "null_default")]
    pub items: Vec<Unstructured>,
}

impl UnstructuredList {
    pub fn from_value(v: Value) -> Result<Self> {
        serde_json::from_value(v).map_err(|e| Error::Decode(e.to_string()))
    }

    /// Kind of the contained items: `PodList` -> `Pod`.
    pub fn item_kind(&self) -> &str { self.kind.strip_suffix("List").unwrap_or(&self.kind) }

    pub fn resource_version(&self) -> Option<&str> { self.metadata.resource_version.as_deref() }

    /// Whether an object belongs to this list's kind.
    pub fn admits(&self, obj: &Unstructured) -> bool {
        obj.api_version == self.api_version && obj.kind == self.item_kind()
    }
}

/// Anything that can be keyed by namespace/name within a collection.
pub trait Identified {
    fn object_key(&self) -> ObjectKey;
}

impl Identified for Unstructured {
    fn object_key(&self) -> ObjectKey { self.key() }
}

/// Apply one event to `items` in place and report whether an item with the
/// same identity was present beforehand.
///
/// ADDED upserts (replacing an existing entry), MODIFIED replaces when present,
/// DELETED removes when present. Inserts append; other positions are kept.
pub fn reconcile<T: Identified>(items: &mut Vec<T>, event_type: EventType, obj: T) -> bool {
    let key = obj.object_key();
    let pos = items.iter().position(|it| it.object_key() == key);
    match (event_type, pos) {
        (EventType::Added | EventType::Modified, Some(i)) => {
            items[i] = obj;
            true
        }
        (EventType::Added, None) => {
            items.push(obj);
            false
        }
        (EventType::Deleted, Some(i)) => {
            items.remove(i);
            true
        }
        (_, pos) => pos.is_some(),
    }
}
