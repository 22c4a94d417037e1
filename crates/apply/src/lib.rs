//! Kinformer apply: create, apply/replace and delete against the backend
//!
//! Objects are stripped of pipeline-derived fields before they are sent and
//! re-processed on the way back. Every successful write is echoed on the
//! [`MutationBus`] so informers for the same backend update without waiting
//! for the watch stream.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use kinformer_core::addressing::object_path;
use kinformer_core::{Error, EventType, Result, Unstructured};
use kinformer_kubehub::transport::{CT_APPLY_PATCH, CT_JSON, CT_JSON_PATCH, CT_MERGE_PATCH};
use kinformer_kubehub::{ApiRequest, ApiVersionResourceCache, MutationBus, MutationNotice, Transport, Verb};
use kinformer_plugins::{IdPlugin, Item, PluginPipeline, RelationPlugin};
use metrics::counter;
use serde_json::{json, Value as Json};
use tracing::{debug, info, warn};

mod yaml;

pub use yaml::{documents_from_yaml, ManifestLimits};

pub const DEFAULT_FIELD_MANAGER: &str = "kinformer";
pub const DEFAULT_NAMESPACE: &str = "default";

/// What a request path is being built for. Only `Create` and `List` address
/// the collection rather than a named object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    List,
    Patch,
    Replace,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::List => "list",
            Action::Patch => "patch",
            Action::Replace => "replace",
            Action::Delete => "delete",
        }
    }

    fn needs_name(&self) -> bool { !matches!(self, Action::Create | Action::List) }
}

/// How `apply_or_replace` updates an object that already exists.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum UpdateStrategy {
    /// Server-side apply with this client's field manager, forcing conflicts.
    #[default]
    Apply,
    Merge,
    /// One JSON-patch op per pointer: `replace` with the new value, or
    /// `remove` when the pointer is absent from the object.
    JsonPatch { paths: Vec<String> },
    /// Full `PUT`.
    Replace,
}

impl fmt::Display for UpdateStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpdateStrategy::Apply => f.write_str("apply"),
            UpdateStrategy::Merge => f.write_str("merge"),
            UpdateStrategy::JsonPatch { paths } => write!(f, "json-patch={}", paths.join(",")),
            UpdateStrategy::Replace => f.write_str("replace"),
        }
    }
}

impl FromStr for UpdateStrategy {
    type Err = String;

    /// `apply`, `merge`, `replace` or `json-patch=/spec/replicas,/spec/paused`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "apply" => Ok(UpdateStrategy::Apply),
            "merge" => Ok(UpdateStrategy::Merge),
            "replace" => Ok(UpdateStrategy::Replace),
            other => match other.strip_prefix("json-patch=") {
                Some(paths) if !paths.is_empty() => {
                    Ok(UpdateStrategy::JsonPatch { paths: paths.split(',').map(str::to_string).collect() })
                }
                _ => Err(format!("unknown update strategy: {other}")),
            },
        }
    }
}

pub struct MutationClient {
    transport: Arc<dyn Transport>,
    discovery: Arc<ApiVersionResourceCache>,
    bus: MutationBus,
    pipeline: PluginPipeline,
    default_namespace: String,
    field_manager: String,
}

impl MutationClient {
    /// Without a pipeline of its own the client still strips ids and relations.
    pub fn new(transport: Arc<dyn Transport>, discovery: Arc<ApiVersionResourceCache>, bus: MutationBus) -> Self {
        Self {
            transport,
            discovery,
            bus,
            pipeline: PluginPipeline::new(vec![Arc::new(IdPlugin), Arc::new(RelationPlugin)]),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
        }
    }

    pub fn with_pipeline(mut self, pipeline: PluginPipeline) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn default_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.default_namespace = namespace.into();
        self
    }

    pub fn field_manager(mut self, field_manager: impl Into<String>) -> Self {
        self.field_manager = field_manager.into();
        self
    }

    pub fn base_path(&self) -> &str { self.discovery.base_path() }
    pub fn bus(&self) -> &MutationBus { &self.bus }

    /// Resolve the REST path for `spec`, filling in `apiVersion` (`v1`) and,
    /// for namespaced kinds outside `List`, the default namespace.
    pub async fn spec_uri_path(&self, spec: &mut Unstructured, action: Action) -> Result<String> {
        if spec.kind.is_empty() {
            return Err(Error::MissingKind);
        }
        if spec.api_version.is_empty() {
            spec.api_version = "v1".into();
        }
        let resource = self.discovery.resolve_by_kind(&spec.api_version, &spec.kind).await?.ok_or_else(|| {
            Error::UnrecognizedResource { api_version: spec.api_version.clone(), kind: spec.kind.clone() }
        })?;
        if resource.namespaced && spec.namespace().is_none() && action != Action::List {
            spec.metadata.namespace = Some(self.default_namespace.clone());
        }
        let name = match action.needs_name() {
            true if spec.name().is_empty() => {
                return Err(Error::MissingName { action: action.as_str().into(), kind: spec.kind.clone() })
            }
            true => Some(spec.name()),
            false => None,
        };
        let namespace = if resource.namespaced { spec.namespace() } else { None };
        Ok(object_path(self.base_path(), &spec.api_version, &resource.name, namespace, name))
    }

    pub async fn read(&self, spec: &Unstructured) -> Result<Unstructured> {
        let mut spec = spec.clone();
        let url = self.spec_uri_path(&mut spec, Action::Read).await?;
        Unstructured::from_value(self.send(ApiRequest::get(url)).await?)
    }

    pub async fn create<I: Into<Item>>(&self, specs: impl IntoIterator<Item = I>) -> Result<Vec<Item>> {
        let mut created = Vec::new();
        for spec in specs {
            let mut spec = self.restore(spec.into());
            created.push(self.post(&mut spec).await?);
        }
        self.publish(EventType::Added, &created);
        self.process(created).await
    }

    /// Update each object that exists with `strategy`, create the others.
    /// Created and updated objects are echoed as one ADDED and one MODIFIED
    /// notice.
    pub async fn apply_or_replace<I: Into<Item>>(
        &self,
        specs: impl IntoIterator<Item = I>,
        strategy: &UpdateStrategy,
    ) -> Result<Vec<Item>> {
        let mut created = Vec::new();
        let mut updated = Vec::new();
        let mut changed = Vec::new();
        for spec in specs {
            let mut spec = self.restore(spec.into());
            let exists = match self.read(&spec).await {
                Ok(_) => true,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            let response = if exists {
                let r = self.update(&mut spec, strategy).await?;
                updated.push(r.clone());
                r
            } else {
                let r = self.post(&mut spec).await?;
                created.push(r.clone());
                r
            };
            changed.push(response);
        }
        self.publish(EventType::Added, &created);
        self.publish(EventType::Modified, &updated);
        self.process(changed).await
    }

    /// Delete each object and return the backend's replies. The local DELETED
    /// echo is only sent with `sync`.
    pub async fn delete<I: Into<Item>>(&self, specs: impl IntoIterator<Item = I>, sync: bool) -> Result<Vec<Json>> {
        let mut replies = Vec::new();
        let mut deleted = Vec::new();
        for spec in specs {
            let mut spec = self.restore(spec.into());
            let url = self.spec_uri_path(&mut spec, Action::Delete).await?;
            replies.push(self.send(ApiRequest::new(Verb::Delete, url)).await?);
            info!(identity = %spec.identity(), kind = %spec.kind, "deleted");
            deleted.push(spec);
        }
        if sync {
            self.publish(EventType::Deleted, &deleted);
        }
        Ok(replies)
    }

    fn restore(&self, item: Item) -> Unstructured { self.pipeline.restore_item(item) }

    async fn process(&self, raws: Vec<Unstructured>) -> Result<Vec<Item>> {
        let mut out = Vec::with_capacity(raws.len());
        for raw in raws {
            out.push(self.pipeline.process_item(raw).await?);
        }
        Ok(out)
    }

    async fn post(&self, spec: &mut Unstructured) -> Result<Unstructured> {
        let url = self.spec_uri_path(spec, Action::Create).await?;
        let body = spec.to_value()?;
        let reply = self.send(ApiRequest::new(Verb::Post, url).body(CT_JSON, body)).await?;
        let obj = response_object(reply, spec)?;
        info!(identity = %obj.identity(), kind = %obj.kind, "created");
        Ok(obj)
    }

    async fn update(&self, spec: &mut Unstructured, strategy: &UpdateStrategy) -> Result<Unstructured> {
        let action = if *strategy == UpdateStrategy::Replace { Action::Replace } else { Action::Patch };
        let url = self.spec_uri_path(spec, action).await?;
        let body = spec.to_value()?;
        let req = match strategy {
            UpdateStrategy::Apply => ApiRequest::new(Verb::Patch, url)
                .query("fieldManager", self.field_manager.as_str())
                .query("force", "true")
                .body(CT_APPLY_PATCH, strip_server_fields(body)),
            UpdateStrategy::Merge => ApiRequest::new(Verb::Patch, url).body(CT_MERGE_PATCH, body),
            UpdateStrategy::JsonPatch { paths } => {
                ApiRequest::new(Verb::Patch, url).body(CT_JSON_PATCH, json_patch_ops(&body, paths))
            }
            UpdateStrategy::Replace => ApiRequest::new(Verb::Put, url).body(CT_JSON, body),
        };
        let obj = response_object(self.send(req).await?, spec)?;
        info!(identity = %obj.identity(), kind = %obj.kind, strategy = %strategy, "updated");
        Ok(obj)
    }

    async fn send(&self, req: ApiRequest) -> Result<Json> {
        let verb = req.verb.as_str();
        debug!(verb, url = %req.url, "mutation request");
        match self.transport.request(req).await {
            Ok(v) => {
                counter!("mutation_ok_total", 1u64, "verb" => verb);
                Ok(v)
            }
            Err(e) => {
                counter!("mutation_err_total", 1u64, "verb" => verb);
                if !e.is_not_found() {
                    warn!(verb, error = %e, "mutation request failed");
                }
                Err(e)
            }
        }
    }

    fn publish(&self, event_type: EventType, items: &[Unstructured]) {
        if items.is_empty() {
            return;
        }
        self.bus.publish(MutationNotice {
            base_path: self.base_path().to_string(),
            event_type,
            items: items.to_vec(),
        });
    }
}

/// The backend's reply object, with kind and apiVersion carried over from
/// the request when the reply omits them.
fn response_object(reply: Json, sent: &Unstructured) -> Result<Unstructured> {
    let mut obj = Unstructured::from_value(reply)?;
    if obj.kind.is_empty() {
        obj.kind = sent.kind.clone();
    }
    if obj.api_version.is_empty() {
        obj.api_version = sent.api_version.clone();
    }
    Ok(obj)
}

/// Server-owned metadata a server-side apply body must not carry.
fn strip_server_fields(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(Json::as_object_mut) {
        meta.remove("resourceVersion");
        meta.remove("managedFields");
    }
    v
}

fn json_patch_ops(body: &Json, paths: &[String]) -> Json {
    let ops: Vec<Json> = paths
        .iter()
        .map(|p| match body.pointer(p) {
            Some(v) => json!({ "op": "replace", "path": p, "value": v }),
            None => json!({ "op": "remove", "path": p }),
        })
        .collect();
    Json::Array(ops)
}
