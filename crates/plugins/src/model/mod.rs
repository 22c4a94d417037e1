//! Typed views over raw resources.
//!
//! A model keeps the raw resource it was built from; everything else is
//! derived. Mutation builders (`scale`, `suspend`, `redeploy`) hand back a
//! modified copy and leave the model untouched.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::try_join_all;
use kinformer_core::image::shortened_image;
use kinformer_core::{Labels, Result, Unstructured};
use serde_json::Value;
use smallvec::SmallVec;

use crate::{Collection, CollectionSource, Item, Plugin};

mod pod;
mod workload;

pub use pod::{pod_restart_count, PodMetricsModel, PodModel};
pub use workload::{matches_selector, CronJobModel, JobModel, WorkloadModel, RESTARTED_AT_ANNOTATION};

/// Read accessors shared by every model.
pub trait ResourceView {
    fn raw(&self) -> &Unstructured;

    fn id(&self) -> String {
        let raw = self.raw();
        raw.id.clone().unwrap_or_else(|| raw.identity())
    }
    fn name(&self) -> &str { self.raw().name() }
    fn namespace(&self) -> Option<&str> { self.raw().namespace() }
    fn labels(&self) -> Option<&Labels> { self.raw().metadata.labels.as_ref() }
    fn annotations(&self) -> Option<&Labels> { self.raw().metadata.annotations.as_ref() }

    /// The retained raw resource, verbatim.
    fn restore(&self) -> Unstructured { self.raw().clone() }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Job,
    CronJob,
    Pod,
}

impl WorkloadKind {
    pub fn from_kind(kind: &str) -> Option<Self> {
        Some(match kind {
            "Deployment" => Self::Deployment,
            "DaemonSet" => Self::DaemonSet,
            "StatefulSet" => Self::StatefulSet,
            "ReplicaSet" => Self::ReplicaSet,
            "Job" => Self::Job,
            "CronJob" => Self::CronJob,
            "Pod" => Self::Pod,
            _ => return None,
        })
    }

    /// Where the pod container list lives for this kind.
    pub fn containers_pointer(&self) -> &'static str {
        match self {
            Self::CronJob => "/spec/jobTemplate/spec/template/spec/containers",
            Self::Pod => "/spec/containers",
            _ => "/spec/template/spec/containers",
        }
    }
}

/// Fields every pod-running kind has in common.
pub trait WorkloadView: ResourceView {
    fn workload_kind(&self) -> Option<WorkloadKind> { WorkloadKind::from_kind(&self.raw().kind) }
    fn spec(&self) -> Option<&Value> { self.raw().spec() }
    fn status(&self) -> Option<&Value> { self.raw().status() }

    fn containers(&self) -> &[Value] {
        let ptr = self.workload_kind().unwrap_or(WorkloadKind::Deployment).containers_pointer();
        self.raw().pointer(ptr).and_then(Value::as_array).map(Vec::as_slice).unwrap_or(&[])
    }

    fn image_names(&self) -> SmallVec<[String; 4]> {
        self.containers()
            .iter()
            .map(|c| shortened_image(c.get("image").and_then(Value::as_str).unwrap_or("")))
            .collect()
    }
}

/// Fallback model for kinds without derived fields.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceModel {
    raw: Unstructured,
}

impl ResourceModel {
    pub fn new(raw: Unstructured) -> Self { Self { raw } }
}

impl ResourceView for ResourceModel {
    fn raw(&self) -> &Unstructured { &self.raw }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Model {
    Resource(ResourceModel),
    Workload(WorkloadModel),
    Job(JobModel),
    CronJob(CronJobModel),
    Pod(PodModel),
    PodMetrics(PodMetricsModel),
}

impl Model {
    /// Pick the model for `raw.kind` and run its initialization, which may
    /// read other collections through `source`.
    pub async fn build(raw: Unstructured, source: &dyn CollectionSource) -> Model {
        match raw.kind.as_str() {
            "Deployment" | "DaemonSet" | "StatefulSet" => Model::Workload(WorkloadModel::load(raw, source).await),
            "CronJob" => Model::CronJob(CronJobModel::new(raw)),
            "Job" => Model::Job(JobModel::new(raw)),
            "Pod" => Model::Pod(PodModel::new(raw)),
            "PodMetrics" => Model::PodMetrics(PodMetricsModel::new(raw)),
            _ => Model::Resource(ResourceModel::new(raw)),
        }
    }

    pub fn into_raw(self) -> Unstructured {
        match self {
            Model::Resource(m) => m.raw,
            Model::Workload(m) => m.into_raw(),
            Model::Job(m) => m.into_raw(),
            Model::CronJob(m) => m.into_raw(),
            Model::Pod(m) => m.into_raw(),
            Model::PodMetrics(m) => m.into_raw(),
        }
    }

    pub fn as_workload(&self) -> Option<&WorkloadModel> {
        match self {
            Model::Workload(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobModel> {
        match self {
            Model::Job(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_cron_job(&self) -> Option<&CronJobModel> {
        match self {
            Model::CronJob(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_pod(&self) -> Option<&PodModel> {
        match self {
            Model::Pod(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_pod_metrics(&self) -> Option<&PodMetricsModel> {
        match self {
            Model::PodMetrics(m) => Some(m),
            _ => None,
        }
    }
}

impl ResourceView for Model {
    fn raw(&self) -> &Unstructured {
        match self {
            Model::Resource(m) => m.raw(),
            Model::Workload(m) => m.raw(),
            Model::Job(m) => m.raw(),
            Model::CronJob(m) => m.raw(),
            Model::Pod(m) => m.raw(),
            Model::PodMetrics(m) => m.raw(),
        }
    }
}

/// Turns raw items into models. Runs last so models see ids and relations.
pub struct ModelPlugin {
    source: Arc<dyn CollectionSource>,
}

impl ModelPlugin {
    pub fn new(source: Arc<dyn CollectionSource>) -> Self { Self { source } }
}

#[async_trait]
impl Plugin for ModelPlugin {
    fn name(&self) -> &'static str { "model" }

    async fn process_item(&self, item: Item) -> Result<Item> {
        Ok(match item {
            Item::Raw(raw) => Item::Model(Model::build(raw, self.source.as_ref()).await),
            model => model,
        })
    }

    async fn process_collection(&self, mut collection: Collection) -> Result<Collection> {
        let items = std::mem::take(&mut collection.items);
        collection.items = try_join_all(items.into_iter().map(|i| self.process_item(i))).await?;
        Ok(collection)
    }

    fn restore_item(&self, item: Item) -> Item {
        match item {
            Item::Model(m) => Item::Raw(m.into_raw()),
            raw => raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticSource;
    use serde_json::json;

    fn raw(v: Value) -> Unstructured { Unstructured::from_value(v).expect("decode") }

    fn empty_pods() -> Arc<StaticSource> {
        StaticSource::with("pods", json!({ "apiVersion": "v1", "kind": "PodList", "items": [] }))
    }

    #[tokio::test]
    async fn dispatches_on_kind() {
        let source = empty_pods();
        let cases = [
            ("apps/v1", "StatefulSet", "workload"),
            ("batch/v1", "CronJob", "cronjob"),
            ("batch/v1", "Job", "job"),
            ("v1", "Pod", "pod"),
            ("metrics.k8s.io/v1beta1", "PodMetrics", "metrics"),
            ("v1", "ConfigMap", "resource"),
        ];
        for (av, kind, want) in cases {
            let m = Model::build(Unstructured::new(av, kind, "x"), source.as_ref()).await;
            let got = match m {
                Model::Workload(_) => "workload",
                Model::CronJob(_) => "cronjob",
                Model::Job(_) => "job",
                Model::Pod(_) => "pod",
                Model::PodMetrics(_) => "metrics",
                Model::Resource(_) => "resource",
            };
            assert_eq!(got, want, "{kind}");
        }
    }

    #[tokio::test]
    async fn cron_job_images_come_from_job_template() {
        let cj = raw(json!({
            "apiVersion": "batch/v1", "kind": "CronJob", "metadata": { "name": "nightly", "namespace": "ops" },
            "spec": { "jobTemplate": { "spec": { "template": { "spec": { "containers": [
                { "name": "a", "image": "index.docker.io/library/busybox:latest" },
                { "name": "b", "image": "quay.io/x/y:1.2" }
            ] } } } } }
        }));
        let m = Model::build(cj.clone(), empty_pods().as_ref()).await;
        let cron = m.as_cron_job().expect("cron job");
        assert_eq!(cron.image_names().as_slice(), ["busybox".to_string(), "quay.io/x/y:1.2".to_string()]);
        assert_eq!(m.id(), "ops/nightly");
        assert_eq!(m.restore(), cj);
    }

    #[tokio::test]
    async fn plugin_restores_raw() {
        let plugin = ModelPlugin::new(empty_pods());
        let cm = Unstructured::new("v1", "ConfigMap", "c");
        let item = plugin.process_item(Item::Raw(cm.clone())).await.expect("process");
        assert!(item.model().is_some());
        assert_eq!(plugin.restore_item(item), Item::Raw(cm));
    }
}
