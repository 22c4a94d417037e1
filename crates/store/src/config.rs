use std::time::Duration;

use kinformer_apply::{ManifestLimits, DEFAULT_FIELD_MANAGER, DEFAULT_NAMESPACE};
use kinformer_kubehub::InformerConfig;
use kinformer_kubehub::watch::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_HEARTBEAT};

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:8001";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Backend base URL, e.g. a `kubectl proxy` endpoint.
    pub api_url: String,
    /// Watch over WebSocket against this base instead of chunked HTTP.
    pub watch_ws_api_url: Option<String>,
    pub field_manager: String,
    pub default_namespace: String,
    pub request_timeout: Duration,
    /// `None` disables the watch dead-man timer.
    pub heartbeat: Option<Duration>,
    pub backoff_max: Duration,
    pub manifest_limits: ManifestLimits,
}

impl StoreConfig {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self {
            api_url: api_url.into(),
            watch_ws_api_url: None,
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            default_namespace: DEFAULT_NAMESPACE.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            heartbeat: Some(DEFAULT_HEARTBEAT),
            backoff_max: DEFAULT_BACKOFF_MAX,
            manifest_limits: ManifestLimits::default(),
        }
    }

    /// Read `KINFORMER_*` variables; anything unset or unparsable keeps its default.
    pub fn from_env() -> Self {
        let var = |k: &str| std::env::var(k).ok().filter(|s| !s.trim().is_empty());
        let secs = |k: &str| var(k).and_then(|s| s.trim().parse::<u64>().ok());
        let count = |k: &str| var(k).and_then(|s| s.trim().parse::<usize>().ok());

        let mut cfg = Self::new(var("KINFORMER_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string()));
        cfg.watch_ws_api_url = var("KINFORMER_WATCH_WS_URL");
        if let Some(fm) = var("KINFORMER_FIELD_MANAGER") {
            cfg.field_manager = fm;
        }
        if let Some(ns) = var("KINFORMER_DEFAULT_NAMESPACE") {
            cfg.default_namespace = ns;
        }
        if let Some(s) = secs("KINFORMER_REQUEST_TIMEOUT_SECS") {
            cfg.request_timeout = Duration::from_secs(s);
        }
        if let Some(s) = secs("KINFORMER_HEARTBEAT_SECS") {
            cfg.heartbeat = (s > 0).then(|| Duration::from_secs(s));
        }
        if let Some(s) = secs("KINFORMER_BACKOFF_MAX_SECS") {
            cfg.backoff_max = Duration::from_secs(s.max(1));
        }
        if let Some(n) = count("KINFORMER_MANIFEST_MAX_BYTES") {
            cfg.manifest_limits.max_bytes = n;
        }
        if let Some(n) = count("KINFORMER_MANIFEST_MAX_VALUES") {
            cfg.manifest_limits.max_values = n;
        }
        cfg
    }

    pub fn informer_config(&self) -> InformerConfig {
        InformerConfig {
            base_path: self.api_url.clone(),
            watch_ws_base_path: self.watch_ws_api_url.clone(),
            heartbeat: self.heartbeat,
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: self.backoff_max,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self { Self::new(DEFAULT_API_URL) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinformer_kubehub::WatchMode;

    // Env mutation is process-global; keep every env assertion in this one test.
    #[test]
    fn env_overrides() {
        std::env::set_var("KINFORMER_API_URL", "http://proxy:8001");
        std::env::set_var("KINFORMER_WATCH_WS_URL", "ws://proxy:8001");
        std::env::set_var("KINFORMER_HEARTBEAT_SECS", "0");
        std::env::set_var("KINFORMER_REQUEST_TIMEOUT_SECS", "nope");
        std::env::set_var("KINFORMER_DEFAULT_NAMESPACE", "team-a");
        std::env::set_var("KINFORMER_MANIFEST_MAX_VALUES", "500");
        let cfg = StoreConfig::from_env();
        for k in [
            "KINFORMER_API_URL",
            "KINFORMER_WATCH_WS_URL",
            "KINFORMER_HEARTBEAT_SECS",
            "KINFORMER_REQUEST_TIMEOUT_SECS",
            "KINFORMER_DEFAULT_NAMESPACE",
            "KINFORMER_MANIFEST_MAX_VALUES",
        ] {
            std::env::remove_var(k);
        }

        assert_eq!(cfg.api_url, "http://proxy:8001");
        assert_eq!(cfg.heartbeat, None);
        assert_eq!(cfg.request_timeout, Duration::from_secs(30));
        assert_eq!(cfg.default_namespace, "team-a");
        assert_eq!(cfg.field_manager, "kinformer");
        assert_eq!(cfg.manifest_limits, ManifestLimits { max_values: 500, ..Default::default() });
        let inf = cfg.informer_config();
        assert_eq!(inf.watch_mode(), WatchMode::WebSocket);
        assert_eq!(inf.backoff_max, Duration::from_secs(1024));
    }
}
