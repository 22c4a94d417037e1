//! Manifest parsing: multi-document YAML (or JSON) into unstructured objects.

use kinformer_core::{Error, Result, Unstructured};
use serde::Deserialize;
use serde_json::Value as Json;

/// Size caps applied before a manifest is turned into objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    /// Raw text length.
    pub max_bytes: usize,
    /// Scalars, arrays and maps counted across every document.
    pub max_values: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self { Self { max_bytes: 1 << 20, max_values: 100_000 } }
}

impl ManifestLimits {
    /// Split `---`-separated documents. Empty documents are skipped, a
    /// `kind: List` document contributes its items.
    pub fn parse(&self, yaml: &str) -> Result<Vec<Unstructured>> {
        if yaml.len() > self.max_bytes {
            return Err(Error::Decode(format!("manifest is {} bytes, limit {}", yaml.len(), self.max_bytes)));
        }
        let mut used = 0usize;
        let mut out = Vec::new();
        for doc in serde_yaml::Deserializer::from_str(yaml) {
            let val = serde_yaml::Value::deserialize(doc).map_err(|e| Error::Decode(format!("parsing YAML: {e}")))?;
            if val.is_null() {
                continue;
            }
            let json = serde_json::to_value(val).map_err(|e| Error::Decode(format!("converting YAML to JSON: {e}")))?;
            used += count_values(&json, self.max_values - used).ok_or_else(|| {
                Error::Decode(format!("manifest holds more than {} values", self.max_values))
            })?;
            match json.get("kind").and_then(Json::as_str) {
                Some("List") => {
                    let items = json.get("items").and_then(Json::as_array).cloned().unwrap_or_default();
                    for item in items {
                        out.push(Unstructured::from_value(item)?);
                    }
                }
                _ => out.push(Unstructured::from_value(json)?),
            }
        }
        Ok(out)
    }
}

/// Values in `root`, or `None` once more than `limit` are seen.
fn count_values(root: &Json, limit: usize) -> Option<usize> {
    let mut stack = vec![root];
    let mut seen = 0usize;
    while let Some(v) = stack.pop() {
        seen += 1;
        if seen > limit {
            return None;
        }
        match v {
            Json::Object(map) => stack.extend(map.values()),
            Json::Array(items) => stack.extend(items),
            _ => {}
        }
    }
    Some(seen)
}

/// [`ManifestLimits::parse`] with the default limits.
pub fn documents_from_yaml(yaml: &str) -> Result<Vec<Unstructured>> { ManifestLimits::default().parse(yaml) }
