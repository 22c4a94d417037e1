use kinformer_core::units::{format_si, parse_si, FormatOptions, Quantity, ResourceQuantity};
use kinformer_core::Unstructured;
use serde_json::Value;

use super::{ResourceView, WorkloadView};

/// Restart count of the first container status, 0 when none is reported.
pub fn pod_restart_count(pod: &Unstructured) -> u64 {
    pod.pointer("/status/containerStatuses/0/restartCount").and_then(Value::as_u64).unwrap_or(0)
}

/// Quantities arrive as strings (`"250m"`) but plain numbers are accepted too.
fn quantity(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::String(s)) => parse_si(s).unwrap_or(0.0),
        Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
        _ => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PodModel {
    raw: Unstructured,
    pub request: ResourceQuantity,
    pub limit: ResourceQuantity,
}

impl PodModel {
    pub fn new(raw: Unstructured) -> Self {
        let (mut req_cpu, mut req_mem, mut lim_cpu, mut lim_mem) = (0.0, 0.0, 0.0, 0.0);
        if let Some(containers) = raw.pointer("/spec/containers").and_then(Value::as_array) {
            for c in containers {
                req_cpu += quantity(c.pointer("/resources/requests/cpu"));
                req_mem += quantity(c.pointer("/resources/requests/memory"));
                lim_cpu += quantity(c.pointer("/resources/limits/cpu"));
                lim_mem += quantity(c.pointer("/resources/limits/memory"));
            }
        }
        Self { raw, request: ResourceQuantity::new(req_cpu, req_mem), limit: ResourceQuantity::new(lim_cpu, lim_mem) }
    }

    pub fn into_raw(self) -> Unstructured { self.raw }

    pub fn restart_count(&self) -> u64 { pod_restart_count(&self.raw) }

    /// `"{ready}/{containers}"`.
    pub fn ready_display(&self) -> String {
        let ready = self
            .raw
            .pointer("/status/containerStatuses")
            .and_then(Value::as_array)
            .map(|s| s.iter().filter(|c| c.get("ready").and_then(Value::as_bool).unwrap_or(false)).count())
            .unwrap_or(0);
        format!("{}/{}", ready, self.containers().len())
    }

    pub fn phase(&self) -> Option<&str> { self.raw.pointer("/status/phase").and_then(Value::as_str) }
}

impl ResourceView for PodModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

impl WorkloadView for PodModel {}

/// `metrics.k8s.io` usage sample for one pod.
#[derive(Debug, Clone, PartialEq)]
pub struct PodMetricsModel {
    raw: Unstructured,
    pub usage: ResourceQuantity,
}

impl PodMetricsModel {
    pub fn new(raw: Unstructured) -> Self {
        let (mut cpu, mut memory) = (0.0, 0.0);
        if let Some(containers) = raw.body.get("containers").and_then(Value::as_array) {
            for c in containers {
                cpu += quantity(c.pointer("/usage/cpu"));
                memory += quantity(c.pointer("/usage/memory"));
            }
        }
        let usage = ResourceQuantity {
            cpu: Quantity {
                value: cpu,
                si: format_si(1000.0 * cpu, &FormatOptions { suffix: "m", ..FormatOptions::default() }.precision(0)),
            },
            memory: Quantity { value: memory, si: format_si(memory, &FormatOptions::binary().precision(0)) },
        };
        Self { raw, usage }
    }

    pub fn into_raw(self) -> Unstructured { self.raw }
}

impl ResourceView for PodMetricsModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod() -> Unstructured {
        Unstructured::from_value(json!({
            "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p", "namespace": "ns" },
            "spec": { "containers": [
                { "name": "a", "image": "docker.io/library/nginx:latest",
                  "resources": { "requests": { "cpu": "250m", "memory": "64Mi" }, "limits": { "cpu": "1", "memory": "128Mi" } } },
                { "name": "b", "image": "ghcr.io/x/sidecar@sha256:0123456789abcdef0123",
                  "resources": { "requests": { "cpu": "250m", "memory": "64Mi" } } }
            ] },
            "status": { "phase": "Running", "containerStatuses": [
                { "name": "a", "ready": true, "restartCount": 4 },
                { "name": "b", "ready": false, "restartCount": 9 }
            ] }
        }))
        .expect("pod")
    }

    #[test]
    fn aggregates_requests_and_limits() {
        let m = PodModel::new(pod());
        assert_eq!(m.request.cpu.value, 0.5);
        assert_eq!(m.request.cpu.si, "500m");
        assert_eq!(m.request.memory.value, 128.0 * 1024.0 * 1024.0);
        assert_eq!(m.request.memory.si, "128Mi");
        assert_eq!(m.limit.cpu.si, "1");
        assert_eq!(m.limit.memory.si, "128Mi");
    }

    #[test]
    fn status_displays() {
        let m = PodModel::new(pod());
        assert_eq!(m.restart_count(), 4);
        assert_eq!(m.ready_display(), "1/2");
        assert_eq!(m.phase(), Some("Running"));
        assert_eq!(m.image_names().as_slice(), ["nginx".to_string(), "ghcr.io/x/sidecar@sha256:01234567\u{2026}".to_string()]);

        let bare = PodModel::new(Unstructured::new("v1", "Pod", "b"));
        assert_eq!(bare.restart_count(), 0);
        assert_eq!(bare.ready_display(), "0/0");
        assert_eq!(bare.request, ResourceQuantity::new(0.0, 0.0));
    }

    #[test]
    fn metrics_usage() {
        let m = PodMetricsModel::new(
            Unstructured::from_value(json!({
                "apiVersion": "metrics.k8s.io/v1beta1", "kind": "PodMetrics",
                "metadata": { "name": "p", "namespace": "ns" },
                "containers": [
                    { "name": "a", "usage": { "cpu": "120m", "memory": "10Mi" } },
                    { "name": "b", "usage": { "cpu": "5m", "memory": "2Mi" } }
                ]
            }))
            .expect("metrics"),
        );
        assert!((m.usage.cpu.value - 0.125).abs() < 1e-9);
        assert_eq!(m.usage.cpu.si, "125m");
        assert_eq!(m.usage.memory.si, "12Mi");
    }
}
