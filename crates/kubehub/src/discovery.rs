//! Per-backend cache of API group/version resource lists.

use std::sync::{Arc, Mutex};

use kinformer_core::addressing::api_version_root;
use kinformer_core::{Error, Result};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::transport::{ApiRequest, Transport};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiResourceDescriptor {
    /// Collection path segment, e.g. `deployments` or `pods/log`.
    pub name: String,
    #[serde(default)]
    pub namespaced: bool,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl ApiResourceDescriptor {
    pub fn supports(&self, verb: &str) -> bool { self.verbs.iter().any(|v| v == verb) }
    pub fn is_subresource(&self) -> bool { self.name.contains('/') }
}

#[derive(Debug, Default, Deserialize)]
struct ApiResourceList {
    #[serde(default)]
    resources: Vec<ApiResourceDescriptor>,
}

type Resources = Arc<Vec<ApiResourceDescriptor>>;

/// Discovery results for one backend, memoized per API root path with no eviction.
pub struct ApiVersionResourceCache {
    base_path: String,
    transport: Arc<dyn Transport>,
    entries: Mutex<FxHashMap<String, Arc<OnceCell<Resources>>>>,
}

impl ApiVersionResourceCache {
    pub fn new(base_path: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        Self { base_path: base_path.into(), transport, entries: Mutex::new(FxHashMap::default()) }
    }

    pub fn base_path(&self) -> &str { &self.base_path }

    /// `None` when the API version is served but has no such kind.
    pub async fn resolve_by_kind(&self, api_version: &str, kind: &str) -> Result<Option<ApiResourceDescriptor>> {
        let resources = self.resources(&api_version_root(api_version), None).await?;
        Ok(resources.iter().find(|r| r.kind == kind && !r.is_subresource()).cloned())
    }

    /// Look up a collection by its literal REST root (`/apis/apps/v1`) and name.
    pub async fn resolve_by_name(
        &self,
        resource_base_path: &str,
        name: &str,
        cancel: Option<&CancellationToken>,
    ) -> Result<Option<ApiResourceDescriptor>> {
        let resources = self.resources(resource_base_path, cancel).await?;
        Ok(resources.iter().find(|r| r.name == name).cloned())
    }

    /// Number of API roots fetched so far.
    pub fn cached_roots(&self) -> usize {
        self.lock().values().filter(|c| c.initialized()).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FxHashMap<String, Arc<OnceCell<Resources>>>> {
        self.entries.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn resources(&self, root: &str, cancel: Option<&CancellationToken>) -> Result<Resources> {
        let cell = self.lock().entry(root.to_string()).or_default().clone();
        let fetch = cell.get_or_try_init(|| self.fetch(root));
        let resources = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => return Err(Error::Cancelled),
                r = fetch => r?,
            },
            None => fetch.await?,
        };
        Ok(resources.clone())
    }

    async fn fetch(&self, root: &str) -> Result<Resources> {
        let url = format!("{}{}", self.base_path, root);
        debug!(url = %url, "fetching api resources");
        let value = self
            .transport
            .request(ApiRequest::get(&url))
            .await
            .map_err(|e| Error::Discovery(format!("{url}: {e}")))?;
        let list: ApiResourceList =
            serde_json::from_value(value).map_err(|e| Error::Discovery(format!("{url}: {e}")))?;
        info!(root = %root, base = %self.base_path, count = list.resources.len(), "api resources discovered");
        Ok(Arc::new(list.resources))
    }
}

/// Process-wide lookup of discovery caches keyed by backend base path.
#[derive(Default)]
pub struct DiscoveryRegistry {
    caches: Mutex<FxHashMap<String, Arc<ApiVersionResourceCache>>>,
}

static GLOBAL: Lazy<DiscoveryRegistry> = Lazy::new(DiscoveryRegistry::default);

impl DiscoveryRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn global() -> &'static DiscoveryRegistry { &GLOBAL }

    /// The shared cache for `base_path`, constructed on first use with `transport`.
    pub fn cache_for(&self, base_path: &str, transport: Arc<dyn Transport>) -> Arc<ApiVersionResourceCache> {
        let mut caches = self.caches.lock().unwrap_or_else(|p| p.into_inner());
        caches
            .entry(base_path.to_string())
            .or_insert_with(|| Arc::new(ApiVersionResourceCache::new(base_path, transport)))
            .clone()
    }

    pub fn len(&self) -> usize { self.caches.lock().map(|c| c.len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}
