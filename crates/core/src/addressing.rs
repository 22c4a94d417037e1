//! Mapping logical resource names onto REST paths and identity keys.

use crate::Unstructured;

pub const DEFAULT_RESOURCE_BASE_PATH: &str = "/api/v1";
pub const DEFAULT_RESOURCE: &str = "namespaces";

/// Caller-supplied hints for locating a collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ResourceMeta {
    pub resource_base_path: Option<String>,
    /// Path segment when it differs from the logical resource name.
    pub k8s_resource: Option<String>,
    pub namespace: Option<String>,
}

impl ResourceMeta {
    pub fn base(resource_base_path: impl Into<String>) -> Self {
        Self { resource_base_path: Some(resource_base_path.into()), ..Default::default() }
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.k8s_resource = Some(resource.into());
        self
    }

    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

/// Resolved location of one collection below a backend base URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceTarget {
    pub resource_base_path: String,
    pub resource: String,
    pub namespace: Option<String>,
}

impl ResourceTarget {
    pub fn new(resource_base_path: impl Into<String>, resource: impl Into<String>) -> Self {
        Self { resource_base_path: resource_base_path.into(), resource: resource.into(), namespace: None }
    }

    /// Without a base path hint the target falls back to the core group's
    /// namespace collection, whatever the logical name.
    pub fn from_meta(resource: &str, meta: Option<&ResourceMeta>) -> Self {
        match meta.and_then(|m| m.resource_base_path.clone().map(|b| (m, b))) {
            Some((m, base)) => Self {
                resource_base_path: base,
                resource: m.k8s_resource.clone().unwrap_or_else(|| resource.to_string()),
                namespace: m.namespace.clone(),
            },
            None => Self::new(DEFAULT_RESOURCE_BASE_PATH, DEFAULT_RESOURCE),
        }
    }

    pub fn url(&self, base_path: &str) -> String {
        build_collection_url(base_path, &self.resource_base_path, &self.resource, self.namespace.as_deref(), None)
    }
}

/// `base_path + resource_base_path[/namespaces/{ns}]/{resource}[/{name}]`
pub fn build_collection_url(
    base_path: &str,
    resource_base_path: &str,
    resource: &str,
    namespace: Option<&str>,
    name: Option<&str>,
) -> String {
    let mut parts = vec![resource_base_path.to_string()];
    if let Some(ns) = namespace.filter(|s| !s.is_empty()) {
        parts.push(format!("namespaces/{ns}"));
    }
    parts.push(resource.to_string());
    if let Some(name) = name.filter(|s| !s.is_empty()) {
        parts.push(name.to_string());
    }
    format!("{}{}", base_path, parts.join("/"))
}

pub fn compute_identity(obj: &Unstructured) -> String {
    match (obj.namespace(), obj.metadata.name.as_deref()) {
        (Some(ns), Some(name)) => format!("{ns}/{name}"),
        (Some(ns), None) => format!("{ns}/"),
        (None, Some(name)) => name.to_string(),
        (None, None) => String::new(),
    }
}

/// Whether the API version belongs to a named group (`apps/v1`) rather than the core group (`v1`).
pub fn is_group_version(api_version: &str) -> bool { api_version.contains('/') }

/// Path suffix of the discovery document for an API version: `/api/v1` or `/apis/{group}/{version}`.
pub fn api_version_root(api_version: &str) -> String {
    let api = if is_group_version(api_version) { "apis" } else { "api" };
    format!("/{api}/{api_version}")
}

pub fn api_version_path(base_path: &str, api_version: &str) -> String {
    format!("{}{}", base_path, api_version_root(api_version))
}

/// Lower-cased REST path of an object (or its collection when `name` is
/// `None`) for write verbs. The base URL is kept as given.
pub fn object_path(
    base_path: &str,
    api_version: &str,
    resource: &str,
    namespace: Option<&str>,
    name: Option<&str>,
) -> String {
    let mut parts = vec![api_version_root(api_version)];
    if let Some(ns) = namespace.filter(|s| !s.is_empty()) {
        parts.push("namespaces".into());
        parts.push(ns.to_string());
    }
    parts.push(resource.to_string());
    if let Some(name) = name {
        parts.push(name.to_string());
    }
    format!("{}{}", base_path, parts.join("/").to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_url_joins_segments() {
        assert_eq!(
            build_collection_url("http://h", "/apis/apps/v1", "deployments", Some("prod"), Some("web")),
            "http://h/apis/apps/v1/namespaces/prod/deployments/web"
        );
        assert_eq!(build_collection_url("", "/api/v1", "nodes", None, None), "/api/v1/nodes");
        assert_eq!(build_collection_url("", "/api/v1", "pods", Some(""), Some("")), "/api/v1/pods");
    }

    #[test]
    fn identity_variants() {
        let mut obj = Unstructured::new("v1", "Pod", "a");
        assert_eq!(compute_identity(&obj), "a");
        obj.metadata.namespace = Some("ns".into());
        assert_eq!(compute_identity(&obj), "ns/a");
        assert_eq!(compute_identity(&Unstructured::default()), "");
    }

    #[test]
    fn target_defaults_to_namespaces() {
        let t = ResourceTarget::from_meta("pods", None);
        assert_eq!(t, ResourceTarget::new("/api/v1", "namespaces"));
        let meta = ResourceMeta::base("/apis/batch/v1").with_resource("cronjobs").in_namespace("ops");
        let t = ResourceTarget::from_meta("jobs-view", Some(&meta));
        assert_eq!(t.url("http://h"), "http://h/apis/batch/v1/namespaces/ops/cronjobs");
    }

    #[test]
    fn object_paths_are_lowercased() {
        assert_eq!(api_version_path("http://h", "v1"), "http://h/api/v1");
        assert_eq!(api_version_path("http://h", "apps/v1"), "http://h/apis/apps/v1");
        assert_eq!(
            object_path("http://H", "apps/v1", "deployments", Some("Prod"), Some("Web")),
            "http://H/apis/apps/v1/namespaces/prod/deployments/web"
        );
        assert_eq!(object_path("", "v1", "namespaces", None, None), "/api/v1/namespaces");
    }
}
