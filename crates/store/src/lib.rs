//! Kinformer store: a process-wide, single-flight cache of live collections

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use kinformer_apply::MutationClient;
use kinformer_core::addressing::{ResourceMeta, ResourceTarget};
use kinformer_core::{Error, EventType, Result, UnstructuredList, WatchEvent};
use kinformer_kubehub::{
    ApiVersionResourceCache, DiscoveryRegistry, HttpTransport, MutationBus, ResourceInformer, Transport,
};
use kinformer_plugins::{Collection, CollectionSource, Item, PluginPipeline};
use metrics::counter;
use rustc_hash::FxHashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

mod config;
mod sink;

pub use config::{StoreConfig, DEFAULT_API_URL};

use sink::{Entry, EntrySink};

/// A change surfaced to subscribers, carrying the processed item.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreEvent {
    pub event_type: EventType,
    pub item: Item,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveEvent {
    Created,
    Updated,
    Deleted,
}

impl StoreEvent {
    pub fn live(&self) -> Option<LiveEvent> {
        match self.event_type {
            EventType::Added => Some(LiveEvent::Created),
            EventType::Modified => Some(LiveEvent::Updated),
            EventType::Deleted => Some(LiveEvent::Deleted),
            _ => None,
        }
    }
}

type Callback = Arc<dyn Fn(&StoreEvent) + Send + Sync>;
type PendingFetch = Shared<BoxFuture<'static, Result<Arc<Collection>>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> { m.lock().unwrap_or_else(|p| p.into_inner()) }

pub(crate) struct Inner {
    config: StoreConfig,
    transport: Arc<dyn Transport>,
    discovery: Arc<ApiVersionResourceCache>,
    bus: MutationBus,
    pub(crate) pipeline: PluginPipeline,
    /// Cached collections by resource name.
    entries: Mutex<FxHashMap<String, Arc<Entry>>>,
    /// In-flight first fetches by (resource name, resource base path).
    pending: Mutex<FxHashMap<(String, String), PendingFetch>>,
    /// One token per resource name, shared by every session opened for it.
    tokens: Mutex<FxHashMap<String, CancellationToken>>,
    subscribers: Mutex<FxHashMap<String, Vec<(Uuid, Callback)>>>,
    root: CancellationToken,
    destroyed: AtomicBool,
}

/// Lets models fetch sibling collections through the cache that owns them.
struct NestedSource(Weak<Inner>);

#[async_trait]
impl CollectionSource for NestedSource {
    async fn collection(&self, resource: &str, meta: &ResourceMeta) -> Result<Arc<Collection>> {
        let inner = self.0.upgrade().ok_or(Error::StoreDestroyed)?;
        inner.get(resource, Some(meta)).await
    }
}

impl Inner {
    fn is_destroyed(&self) -> bool { self.destroyed.load(Ordering::Acquire) }

    fn cached(&self, resource: &str) -> Option<Arc<Collection>> {
        lock(&self.entries).get(resource).and_then(|e| e.snapshot.load_full())
    }

    async fn get(self: &Arc<Self>, resource: &str, meta: Option<&ResourceMeta>) -> Result<Arc<Collection>> {
        if self.is_destroyed() {
            return Err(Error::StoreDestroyed);
        }
        if let Some(c) = self.cached(resource) {
            return Ok(c);
        }
        let target = ResourceTarget::from_meta(resource, meta);
        let key = (resource.to_string(), target.resource_base_path.clone());
        let fetch = {
            let mut pending = lock(&self.pending);
            if let Some(c) = self.cached(resource) {
                return Ok(c);
            }
            match pending.get(&key) {
                Some(f) => {
                    counter!("store_single_flight_joined_total", 1u64);
                    debug!(resource = %resource, "joining in-flight fetch");
                    f.clone()
                }
                None => {
                    let f = self.fetch(resource.to_string(), target, key.clone());
                    pending.insert(key, f.clone());
                    f
                }
            }
        };
        fetch.await
    }

    fn fetch(self: &Arc<Self>, resource: String, target: ResourceTarget, key: (String, String)) -> PendingFetch {
        let weak = Arc::downgrade(self);
        async move {
            let inner = weak.upgrade().ok_or(Error::StoreDestroyed)?;
            let out = inner.open(&resource, target).await;
            lock(&inner.pending).remove(&key);
            out
        }
        .boxed()
        .shared()
    }

    fn token(&self, resource: &str) -> CancellationToken {
        let mut tokens = lock(&self.tokens);
        match tokens.get(resource) {
            Some(t) if !t.is_cancelled() => t.clone(),
            _ => {
                let t = self.root.child_token();
                tokens.insert(resource.to_string(), t.clone());
                t
            }
        }
    }

    /// Collections are cached by resource name. When fetches under two base
    /// paths race, the first to finish is kept and the other session stops.
    async fn open(self: &Arc<Self>, resource: &str, target: ResourceTarget) -> Result<Arc<Collection>> {
        let token = self.token(resource);
        let entry = Arc::new(Entry::new());
        let sink = Arc::new(EntrySink { resource: resource.to_string(), entry: entry.clone(), inner: Arc::downgrade(self) });
        let informer = ResourceInformer::new(
            target,
            self.config.informer_config(),
            self.transport.clone(),
            self.discovery.clone(),
            self.bus.clone(),
        );
        let stop = match informer.list_watch(sink, token).await {
            Ok(stop) => stop,
            Err(e) => {
                let others = lock(&self.pending).keys().filter(|(r, _)| r == resource).count() > 1;
                if !others && self.cached(resource).is_none() {
                    lock(&self.tokens).remove(resource);
                }
                warn!(resource = %resource, error = %e, "collection fetch failed");
                return Err(e);
            }
        };
        entry.set_stop(stop);
        if self.is_destroyed() {
            entry.stop();
            return Err(Error::StoreDestroyed);
        }
        let snapshot = entry.snapshot.load_full().unwrap_or_default();
        let mut entries = lock(&self.entries);
        let kept = entries.get(resource).and_then(|e| e.snapshot.load_full());
        if let Some(kept) = kept {
            drop(entries);
            entry.stop();
            debug!(resource = %resource, "duplicate session stopped");
            return Ok(kept);
        }
        entries.insert(resource.to_string(), entry);
        drop(entries);
        info!(resource = %resource, items = snapshot.len(), "collection cached");
        Ok(snapshot)
    }

    pub(crate) fn notify(&self, resource: &str, event: &StoreEvent) {
        if event.event_type == EventType::Ping {
            return;
        }
        let callbacks: Vec<Callback> =
            lock(&self.subscribers).get(resource).map(|s| s.iter().map(|(_, cb)| cb.clone()).collect()).unwrap_or_default();
        for cb in callbacks {
            cb(event);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) { self.root.cancel(); }
}

/// Removes its callback on [`Subscription::unsubscribe`]; dropping it keeps
/// the callback registered.
pub struct Subscription {
    inner: Weak<Inner>,
    resource: String,
    id: Uuid,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else { return };
        let mut subs = lock(&inner.subscribers);
        if let Some(list) = subs.get_mut(&self.resource) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                subs.remove(&self.resource);
            }
        }
    }
}

/// Shared handle to the cache; clones see the same collections.
#[derive(Clone)]
pub struct CollectionCache {
    inner: Arc<Inner>,
}

impl CollectionCache {
    /// HTTP transport and the process-wide discovery cache for `config.api_url`.
    pub fn new(config: StoreConfig) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(HttpTransport::new(Some(config.request_timeout))?);
        let discovery = DiscoveryRegistry::global().cache_for(&config.api_url, transport.clone());
        Ok(Self::build(config, transport, discovery))
    }

    /// Private discovery cache over an injected transport.
    pub fn with_transport(config: StoreConfig, transport: Arc<dyn Transport>) -> Self {
        let discovery = Arc::new(ApiVersionResourceCache::new(config.api_url.clone(), transport.clone()));
        Self::build(config, transport, discovery)
    }

    fn build(config: StoreConfig, transport: Arc<dyn Transport>, discovery: Arc<ApiVersionResourceCache>) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            config,
            transport,
            discovery,
            bus: MutationBus::default(),
            pipeline: PluginPipeline::standard(Arc::new(NestedSource(weak.clone()))),
            entries: Mutex::new(FxHashMap::default()),
            pending: Mutex::new(FxHashMap::default()),
            tokens: Mutex::new(FxHashMap::default()),
            subscribers: Mutex::new(FxHashMap::default()),
            root: CancellationToken::new(),
            destroyed: AtomicBool::new(false),
        });
        Self { inner }
    }

    pub fn config(&self) -> &StoreConfig { &self.inner.config }
    pub fn bus(&self) -> &MutationBus { &self.inner.bus }
    pub fn pipeline(&self) -> &PluginPipeline { &self.inner.pipeline }
    pub fn is_destroyed(&self) -> bool { self.inner.is_destroyed() }

    /// The live collection for `resource`. Concurrent callers for the same
    /// resource and base path share one LIST; later callers get the cached,
    /// watch-maintained snapshot.
    pub async fn get(&self, resource: &str, meta: Option<&ResourceMeta>) -> Result<Arc<Collection>> {
        self.inner.get(resource, meta).await
    }

    /// One item by identity; `None` when absent or the collection does not exist.
    pub async fn get_one(&self, resource: &str, meta: Option<&ResourceMeta>, identity: &str) -> Result<Option<Item>> {
        match self.get(resource, meta).await {
            Ok(c) => Ok(c.get(identity).cloned()),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn subscribe<F>(&self, resource: &str, on_event: F) -> Subscription
    where
        F: Fn(&StoreEvent) + Send + Sync + 'static,
    {
        let id = Uuid::new_v4();
        lock(&self.inner.subscribers).entry(resource.to_string()).or_default().push((id, Arc::new(on_event)));
        Subscription { inner: Arc::downgrade(&self.inner), resource: resource.to_string(), id }
    }

    /// Reflect an externally observed event into the cached collection and
    /// tell subscribers. Liveness and bookkeeping events are dropped.
    pub async fn publish(&self, resource: &str, event: WatchEvent) -> Result<()> {
        if !matches!(event.event_type, EventType::Added | EventType::Modified | EventType::Deleted) {
            return Ok(());
        }
        let item = match event.event_type {
            EventType::Deleted => Item::Raw(event.object),
            _ => self.inner.pipeline.process_item(event.object).await?,
        };
        let entry = lock(&self.inner.entries).get(resource).cloned();
        if let Some(entry) = entry {
            entry.apply(event.event_type, item.clone(), None);
        }
        self.inner.notify(resource, &StoreEvent { event_type: event.event_type, item });
        Ok(())
    }

    /// Cancel sessions by resource name, or all of them. In-flight fetches
    /// fail with `Cancelled`; cached data stays but stops updating.
    pub fn cancel_queries(&self, resources: Option<&[&str]>) {
        let mut tokens = lock(&self.inner.tokens);
        let cancelled: Vec<(String, CancellationToken)> = match resources {
            Some(names) => names.iter().filter_map(|n| tokens.remove_entry(*n)).collect(),
            None => tokens.drain().collect(),
        };
        drop(tokens);
        for (name, token) in cancelled {
            debug!(resource = %name, "query cancelled");
            token.cancel();
        }
    }

    /// Stop every session and reject further reads. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.root.cancel();
        let entries: Vec<Arc<Entry>> = lock(&self.inner.entries).drain().map(|(_, e)| e).collect();
        for e in &entries {
            e.stop();
        }
        lock(&self.inner.pending).clear();
        lock(&self.inner.tokens).clear();
        lock(&self.inner.subscribers).clear();
        info!(collections = entries.len(), "store destroyed");
    }

    pub fn restore_item(&self, item: Item) -> kinformer_core::Unstructured { self.inner.pipeline.restore_item(item) }

    pub fn restore_collection(&self, collection: Collection) -> UnstructuredList {
        self.inner.pipeline.restore_collection(collection)
    }

    /// A client whose mutations reach this cache's informers through the shared bus.
    pub fn mutation_client(&self) -> MutationClient {
        MutationClient::new(self.inner.transport.clone(), self.inner.discovery.clone(), self.inner.bus.clone())
            .with_pipeline(self.inner.pipeline.clone())
            .default_namespace(self.inner.config.default_namespace.clone())
            .field_manager(self.inner.config.field_manager.clone())
    }
}
