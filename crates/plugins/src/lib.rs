//! Kinformer plugins: reversible post-processing of fetched collections
//!
//! Every plugin turns raw items into derived items on the way in and back into
//! raw form before write-back. The pipeline applies plugins in order and
//! restores in reverse order.

#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use kinformer_core::addressing::ResourceMeta;
use kinformer_core::{Identified, ListMeta, ObjectKey, Result, Unstructured, UnstructuredList};
use serde::{Serialize, Serializer};

mod id;
pub mod model;
mod relation;

pub use id::IdPlugin;
pub use model::{Model, ModelPlugin, ResourceView, WorkloadKind, WorkloadView};
pub use relation::RelationPlugin;

/// A collection entry: raw until the model plugin materializes it.
#[derive(Debug, Clone, PartialEq)]
pub enum Item {
    Raw(Unstructured),
    Model(Model),
}

impl Item {
    pub fn raw(&self) -> &Unstructured {
        match self {
            Item::Raw(r) => r,
            Item::Model(m) => m.raw(),
        }
    }

    pub fn into_raw(self) -> Unstructured {
        match self {
            Item::Raw(r) => r,
            Item::Model(m) => m.into_raw(),
        }
    }

    pub fn model(&self) -> Option<&Model> {
        match self {
            Item::Model(m) => Some(m),
            Item::Raw(_) => None,
        }
    }

    /// Pipeline-assigned id, falling back to the computed identity.
    pub fn id(&self) -> String {
        let raw = self.raw();
        raw.id.clone().unwrap_or_else(|| raw.identity())
    }
}

impl From<Unstructured> for Item {
    fn from(raw: Unstructured) -> Self { Item::Raw(raw) }
}

impl Identified for Item {
    fn object_key(&self) -> ObjectKey { self.raw().key() }
}

impl Serialize for Item {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> { self.raw().serialize(s) }
}

/// A processed LIST result.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Collection {
    pub api_version: String,
    pub kind: String,
    pub metadata: ListMeta,
    pub items: Vec<Item>,
}

impl Collection {
    pub fn from_list(list: UnstructuredList) -> Self {
        Self {
            api_version: list.api_version,
            kind: list.kind,
            metadata: list.metadata,
            items: list.items.into_iter().map(Item::Raw).collect(),
        }
    }

    pub fn into_list(self) -> UnstructuredList {
        UnstructuredList {
            api_version: self.api_version,
            kind: self.kind,
            metadata: self.metadata,
            items: self.items.into_iter().map(Item::into_raw).collect(),
        }
    }

    pub fn item_kind(&self) -> &str { self.kind.strip_suffix("List").unwrap_or(&self.kind) }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Find an item by `namespace/name` or bare name.
    pub fn get(&self, identity: &str) -> Option<&Item> { self.items.iter().find(|i| i.raw().identity() == identity) }
}

/// Where models fetch other collections from (restart aggregation reads pods).
#[async_trait]
pub trait CollectionSource: Send + Sync {
    async fn collection(&self, resource: &str, meta: &ResourceMeta) -> Result<Arc<Collection>>;
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn process_item(&self, item: Item) -> Result<Item>;

    async fn process_collection(&self, mut collection: Collection) -> Result<Collection> {
        let mut items = Vec::with_capacity(collection.items.len());
        for item in collection.items {
            items.push(self.process_item(item).await?);
        }
        collection.items = items;
        Ok(collection)
    }

    fn restore_item(&self, item: Item) -> Item;

    fn restore_collection(&self, mut collection: Collection) -> Collection {
        collection.items = collection.items.into_iter().map(|i| self.restore_item(i)).collect();
        collection
    }
}

/// Ordered plugin chain.
#[derive(Clone, Default)]
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self { Self { plugins } }

    /// Id assignment, relation inference, then model materialization.
    pub fn standard(source: Arc<dyn CollectionSource>) -> Self {
        Self::new(vec![Arc::new(IdPlugin), Arc::new(RelationPlugin), Arc::new(ModelPlugin::new(source))])
    }

    pub fn names(&self) -> Vec<&'static str> { self.plugins.iter().map(|p| p.name()).collect() }

    /// Items inherit the list's kind and apiVersion when they lack them.
    pub async fn process_list(&self, list: UnstructuredList) -> Result<Collection> {
        let mut collection = Collection::from_list(list);
        let kind = collection.item_kind().to_string();
        for item in collection.items.iter_mut() {
            if let Item::Raw(raw) = item {
                if raw.kind.is_empty() {
                    raw.kind = kind.clone();
                }
                if raw.api_version.is_empty() {
                    raw.api_version = collection.api_version.clone();
                }
            }
        }
        for plugin in &self.plugins {
            collection = plugin.process_collection(collection).await?;
        }
        Ok(collection)
    }

    pub async fn process_item(&self, raw: Unstructured) -> Result<Item> {
        let mut item = Item::Raw(raw);
        for plugin in &self.plugins {
            item = plugin.process_item(item).await?;
        }
        Ok(item)
    }

    pub fn restore_item(&self, item: Item) -> Unstructured {
        self.plugins.iter().rev().fold(item, |acc, p| p.restore_item(acc)).into_raw()
    }

    pub fn restore_collection(&self, collection: Collection) -> UnstructuredList {
        self.plugins.iter().rev().fold(collection, |acc, p| p.restore_collection(acc)).into_list()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StaticSource;
    use super::*;
    use serde_json::json;

    fn deployment() -> Unstructured {
        Unstructured::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "3", "labels": { "tier": "fe" } },
            "spec": {
                "replicas": 2,
                "selector": { "matchLabels": { "app": "web" } },
                "template": { "spec": { "containers": [{ "name": "c", "image": "docker.io/library/nginx:latest" }] } }
            },
            "status": { "readyReplicas": 2 }
        }))
        .expect("deployment")
    }

    #[tokio::test]
    async fn standard_order_and_round_trip() {
        let source = StaticSource::with("pods", json!({ "apiVersion": "v1", "kind": "PodList", "items": [] }));
        let pipeline = PluginPipeline::standard(source);
        assert_eq!(pipeline.names(), vec!["id", "relation", "model"]);

        let raw = deployment();
        let item = pipeline.process_item(raw.clone()).await.expect("process");
        let model = item.model().expect("model");
        assert_eq!(model.id(), "prod/web");
        assert_eq!(item.raw().metadata.relations.as_ref().map(|r| r.len()), Some(1));
        assert_eq!(pipeline.restore_item(item), raw);
    }

    #[tokio::test]
    async fn list_items_inherit_kind() {
        let pipeline = PluginPipeline::new(vec![Arc::new(IdPlugin)]);
        let list = UnstructuredList::from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMapList", "metadata": { "resourceVersion": "5" },
            "items": [{ "metadata": { "name": "a", "namespace": "x" } }, { "metadata": { "name": "b" } }]
        }))
        .expect("list");
        let c = pipeline.process_list(list).await.expect("process");
        assert_eq!(c.items[0].raw().kind, "ConfigMap");
        assert_eq!(c.items[0].raw().api_version, "v1");
        assert_eq!(c.items[0].id(), "x/a");
        assert_eq!(c.items[1].id(), "b");
        assert!(c.get("x/a").is_some());

        let restored = pipeline.restore_collection(c);
        assert_eq!(restored.metadata.resource_version.as_deref(), Some("5"));
        assert!(restored.items.iter().all(|i| i.id.is_none()));
    }

    #[test]
    fn item_serializes_as_raw() {
        let mut raw = Unstructured::new("v1", "Pod", "p");
        raw.id = Some("p".into());
        let v = serde_json::to_value(Item::Raw(raw)).expect("encode");
        assert_eq!(v, json!({ "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" }, "id": "p" }));
    }
}
