use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kinformer_core::addressing::{ResourceMeta, DEFAULT_RESOURCE_BASE_PATH};
use kinformer_core::time::{elapsed_time, now_rfc3339, parse_rfc3339, seconds_between};
use kinformer_core::{Labels, Unstructured};
use serde_json::Value;
use tracing::warn;

use super::{pod_restart_count, ResourceView, WorkloadKind, WorkloadView};
use crate::CollectionSource;

/// Pod template annotation bumped by `redeploy` to force a rollout.
pub const RESTARTED_AT_ANNOTATION: &str = "kinformer.io/restartedAt";

/// Deployment, DaemonSet or StatefulSet.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadModel {
    raw: Unstructured,
    /// Sum of container restarts across pods the selector matches.
    pub restarts: u64,
}

impl WorkloadModel {
    pub fn new(raw: Unstructured) -> Self { Self { raw, restarts: 0 } }

    /// Build and aggregate restarts from the cluster's pods. A failed pod
    /// fetch leaves `restarts` at zero.
    pub async fn load(raw: Unstructured, source: &dyn CollectionSource) -> Self {
        let mut model = Self::new(raw);
        let Some(selector) = model.selector() else { return model };
        let meta = ResourceMeta::base(DEFAULT_RESOURCE_BASE_PATH);
        match source.collection("pods", &meta).await {
            Ok(pods) => {
                model.restarts = pods
                    .items
                    .iter()
                    .map(|p| p.raw())
                    .filter(|p| p.namespace() == model.raw.namespace())
                    .filter(|p| matches_selector(p.metadata.labels.as_ref(), &selector))
                    .map(pod_restart_count)
                    .sum();
            }
            Err(e) => warn!(workload = %model.raw.identity(), error = %e, "pod lookup for restarts failed"),
        }
        model
    }

    pub fn into_raw(self) -> Unstructured { self.raw }

    pub fn selector(&self) -> Option<LabelSelector> {
        self.raw.pointer("/spec/selector").and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn replicas(&self) -> Option<i64> { self.raw.pointer("/spec/replicas").and_then(Value::as_i64) }

    /// Copy with `spec.replicas = n`. DaemonSets have no replica count and
    /// come back unchanged.
    pub fn scale(&self, replicas: u32) -> Unstructured {
        let mut copy = self.raw.clone();
        if matches!(self.workload_kind(), Some(WorkloadKind::Deployment | WorkloadKind::StatefulSet)) {
            copy.set_path(&["spec", "replicas"], Value::from(replicas));
        }
        copy
    }

    /// Copy with a fresh restart timestamp on the pod template.
    pub fn redeploy(&self) -> Unstructured {
        let mut copy = self.raw.clone();
        copy.set_path(
            &["spec", "template", "metadata", "annotations", RESTARTED_AT_ANNOTATION],
            Value::String(now_rfc3339()),
        );
        copy
    }
}

impl ResourceView for WorkloadModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

impl WorkloadView for WorkloadModel {}

/// Whether `labels` satisfy `selector`. A selector with no terms matches nothing.
pub fn matches_selector(labels: Option<&Labels>, selector: &LabelSelector) -> bool {
    let match_labels = selector.match_labels.as_ref().filter(|m| !m.is_empty());
    let expressions = selector.match_expressions.as_ref().filter(|e| !e.is_empty());
    if match_labels.is_none() && expressions.is_none() {
        return false;
    }
    let get = |k: &str| labels.and_then(|l| l.get(k));

    let labels_ok = match_labels.map_or(true, |m| m.iter().all(|(k, v)| get(k.as_str()) == Some(v)));
    let exprs_ok = expressions.map_or(true, |exprs| {
        exprs.iter().all(|req| {
            let values = req.values.as_deref().unwrap_or(&[]);
            match req.operator.as_str() {
                "In" => get(req.key.as_str()).is_some_and(|v| values.contains(v)),
                "NotIn" => get(req.key.as_str()).map_or(true, |v| !values.contains(v)),
                "Exists" => get(req.key.as_str()).is_some(),
                "DoesNotExist" => get(req.key.as_str()).is_none(),
                _ => false,
            }
        })
    });
    labels_ok && exprs_ok
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobModel {
    raw: Unstructured,
}

impl JobModel {
    pub fn new(raw: Unstructured) -> Self { Self { raw } }
    pub fn into_raw(self) -> Unstructured { self.raw }

    fn status_time(&self, field: &str) -> Option<DateTime<Utc>> {
        self.raw.status()?.get(field)?.as_str().and_then(parse_rfc3339)
    }

    /// Seconds from start to completion, or to now while running; 0 before start.
    pub fn duration(&self) -> u64 { self.duration_at(Utc::now()) }

    pub fn duration_at(&self, now: DateTime<Utc>) -> u64 {
        match (self.status_time("startTime"), self.status_time("completionTime")) {
            (Some(start), Some(end)) => seconds_between(start, end),
            (Some(start), None) => seconds_between(start, now),
            _ => 0,
        }
    }

    pub fn duration_display(&self) -> String { elapsed_time(self.duration()).map(|e| e.label).unwrap_or_default() }

    /// `"{succeeded}/{completions}"`; completions defaults to 1.
    pub fn completions_display(&self) -> String {
        let succeeded = self.raw.pointer("/status/succeeded").and_then(Value::as_u64).unwrap_or(0);
        let completions = self.raw.pointer("/spec/completions").and_then(Value::as_u64).unwrap_or(1);
        format!("{succeeded}/{completions}")
    }
}

impl ResourceView for JobModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

impl WorkloadView for JobModel {}

#[derive(Debug, Clone, PartialEq)]
pub struct CronJobModel {
    raw: Unstructured,
}

impl CronJobModel {
    pub fn new(raw: Unstructured) -> Self { Self { raw } }
    pub fn into_raw(self) -> Unstructured { self.raw }

    pub fn is_suspended(&self) -> bool { self.raw.pointer("/spec/suspend").and_then(Value::as_bool).unwrap_or(false) }

    pub fn suspend(&self) -> Unstructured { self.with_suspend(true) }
    pub fn resume(&self) -> Unstructured { self.with_suspend(false) }

    fn with_suspend(&self, suspend: bool) -> Unstructured {
        let mut copy = self.raw.clone();
        copy.set_path(&["spec", "suspend"], Value::Bool(suspend));
        copy
    }
}

impl ResourceView for CronJobModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

impl WorkloadView for CronJobModel {}
