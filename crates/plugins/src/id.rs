use async_trait::async_trait;
use kinformer_core::Result;

use crate::{Item, Plugin};

/// Stamps `id` (`namespace/name` or `name`) on raw items.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdPlugin;

#[async_trait]
impl Plugin for IdPlugin {
    fn name(&self) -> &'static str { "id" }

    async fn process_item(&self, item: Item) -> Result<Item> {
        Ok(match item {
            Item::Raw(mut raw) => {
                raw.id = Some(raw.identity());
                Item::Raw(raw)
            }
            other => other,
        })
    }

    /// Models are unwrapped too; their raw still carries the id.
    fn restore_item(&self, item: Item) -> Item {
        let mut raw = item.into_raw();
        raw.id = None;
        Item::Raw(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceModel;
    use crate::Model;
    use kinformer_core::Unstructured;

    #[tokio::test]
    async fn assigns_and_strips_id() {
        let mut raw = Unstructured::new("v1", "Secret", "s");
        raw.metadata.namespace = Some("kube-system".into());
        let item = IdPlugin.process_item(Item::Raw(raw.clone())).await.expect("process");
        assert_eq!(item.raw().id.as_deref(), Some("kube-system/s"));
        assert_eq!(IdPlugin.restore_item(item).into_raw(), raw);
    }

    #[tokio::test]
    async fn strips_id_from_models() {
        let raw = Unstructured::new("v1", "ConfigMap", "c");
        let Item::Raw(stamped) = IdPlugin.process_item(Item::Raw(raw.clone())).await.expect("process") else {
            panic!("raw in, raw out");
        };
        let model = Item::Model(Model::Resource(ResourceModel::new(stamped)));
        let restored = IdPlugin.restore_item(model);
        assert!(restored.model().is_none());
        assert_eq!(restored.into_raw(), raw);
    }
}
