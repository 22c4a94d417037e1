//! Informer sink that keeps one cache entry's processed snapshot current.

use std::sync::{Arc, Mutex, Weak};

use arc_swap::ArcSwapOption;
use async_trait::async_trait;
use kinformer_core::{reconcile, Error, EventType, Identified, ListMeta, Result, UnstructuredList, WatchEvent};
use kinformer_kubehub::{InformerSink, StopHandle};
use kinformer_plugins::{Collection, Item};
use tracing::debug;

use crate::{Inner, StoreEvent};

/// One resource's cached collection. Readers load the snapshot lock-free;
/// every applied event installs a new one.
pub(crate) struct Entry {
    pub(crate) snapshot: ArcSwapOption<Collection>,
    pub(crate) stop: Mutex<Option<StopHandle>>,
}

impl Entry {
    pub(crate) fn new() -> Self { Self { snapshot: ArcSwapOption::empty(), stop: Mutex::new(None) } }

    pub(crate) fn set_stop(&self, handle: StopHandle) {
        *self.stop.lock().unwrap_or_else(|p| p.into_inner()) = Some(handle);
    }

    pub(crate) fn stop(&self) {
        if let Some(h) = self.stop.lock().unwrap_or_else(|p| p.into_inner()).as_ref() {
            h.stop();
        }
    }

    /// Apply one already-processed item on top of the current snapshot.
    pub(crate) fn apply(&self, event_type: EventType, item: Item, metadata: Option<ListMeta>) {
        self.snapshot.rcu(|cur| {
            let mut next = cur.as_deref().cloned().unwrap_or_default();
            if let Some(m) = &metadata {
                next.metadata = m.clone();
            }
            reconcile(&mut next.items, event_type, item.clone());
            Some(Arc::new(next))
        });
    }

    /// The processed form of `key`'s object, if the snapshot holds it.
    pub(crate) fn find(&self, event: &WatchEvent) -> Option<Item> {
        let key = event.object.key();
        self.snapshot.load_full().and_then(|c| c.items.iter().find(|i| i.object_key() == key).cloned())
    }
}

pub(crate) struct EntrySink {
    pub(crate) resource: String,
    pub(crate) entry: Arc<Entry>,
    pub(crate) inner: Weak<Inner>,
}

impl EntrySink {
    fn inner(&self) -> Result<Arc<Inner>> { self.inner.upgrade().ok_or(Error::StoreDestroyed) }
}

#[async_trait]
impl InformerSink for EntrySink {
    async fn on_response(&self, list: &UnstructuredList, event: Option<&WatchEvent>) -> Result<()> {
        let inner = self.inner()?;
        match event {
            Some(ev) if self.entry.snapshot.load().is_some() => {
                let item = match ev.event_type {
                    EventType::Deleted => Item::Raw(ev.object.clone()),
                    _ => inner.pipeline.process_item(ev.object.clone()).await?,
                };
                self.entry.apply(ev.event_type, item, Some(list.metadata.clone()));
            }
            _ => {
                let next = inner.pipeline.process_list(list.clone()).await?;
                debug!(resource = %self.resource, items = next.len(), "snapshot replaced");
                self.entry.snapshot.store(Some(Arc::new(next)));
            }
        }
        Ok(())
    }

    async fn on_event(&self, event: &WatchEvent) {
        let Ok(inner) = self.inner() else { return };
        let item = match event.event_type {
            EventType::Deleted => None,
            _ => self.entry.find(event),
        };
        let item = item.unwrap_or_else(|| Item::Raw(event.object.clone()));
        inner.notify(&self.resource, &StoreEvent { event_type: event.event_type, item });
    }
}
