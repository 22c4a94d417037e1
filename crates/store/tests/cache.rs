use std::sync::{Arc, Mutex};
use std::time::Duration;

use kinformer_core::addressing::ResourceMeta;
use kinformer_core::{Error, EventType, Unstructured, WatchEvent};
use kinformer_kubehub::mock::MockTransport;
use kinformer_kubehub::Verb;
use kinformer_plugins::{Collection, Model};
use kinformer_store::{CollectionCache, LiveEvent, StoreConfig};
use serde_json::{json, Value};

const BASE: &str = "http://m";
const PODS: &str = "http://m/api/v1/pods";
const DEPLOYMENTS: &str = "http://m/apis/apps/v1/deployments";
const CONFIGMAPS: &str = "http://m/api/v1/configmaps";
const POD_METRICS: &str = "http://m/apis/metrics.k8s.io/v1beta1/pods";

fn core() -> ResourceMeta { ResourceMeta::base("/api/v1") }

fn pod(ns: &str, name: &str, app: &str, restarts: u64) -> Value {
    json!({
        "metadata": { "name": name, "namespace": ns, "resourceVersion": "1", "labels": { "app": app } },
        "spec": { "containers": [{ "name": "c", "image": "nginx" }] },
        "status": { "containerStatuses": [{ "name": "c", "ready": true, "restartCount": restarts }] }
    })
}

fn pod_obj(name: &str, rv: &str) -> Unstructured {
    Unstructured::from_value(json!({
        "apiVersion": "v1", "kind": "Pod",
        "metadata": { "name": name, "namespace": "ns", "resourceVersion": rv }
    }))
    .expect("pod")
}

fn backend(delay: Option<Duration>) -> Arc<MockTransport> {
    let t = match delay {
        Some(d) => MockTransport::new().with_delay(d),
        None => MockTransport::new(),
    };
    t.on(
        Verb::Get,
        "http://m/api/v1",
        json!({ "resources": [
            { "name": "pods", "namespaced": true, "kind": "Pod", "verbs": ["list", "watch"] },
            { "name": "configmaps", "namespaced": true, "kind": "ConfigMap", "verbs": ["create", "list", "watch"] }
        ] }),
    );
    t.on(
        Verb::Get,
        "http://m/apis/apps/v1",
        json!({ "resources": [{ "name": "deployments", "namespaced": true, "kind": "Deployment", "verbs": ["list", "watch"] }] }),
    );
    t.on(
        Verb::Get,
        PODS,
        json!({
            "apiVersion": "v1", "kind": "PodList", "metadata": { "resourceVersion": "10" },
            "items": [
                pod("prod", "web-1", "web", 5),
                pod("prod", "web-2", "web", 3),
                pod("staging", "web-3", "web", 7),
                pod("prod", "db-1", "db", 2)
            ]
        }),
    );
    Arc::new(t)
}

fn cache(t: &Arc<MockTransport>) -> CollectionCache {
    let mut cfg = StoreConfig::new(BASE);
    cfg.heartbeat = None;
    CollectionCache::with_transport(cfg, t.clone())
}

async fn settle() { tokio::time::sleep(Duration::from_millis(10)).await; }

type Seen = Arc<Mutex<Vec<(EventType, String, bool)>>>;

fn record(cache: &CollectionCache, resource: &str) -> (Seen, kinformer_store::Subscription) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    let sub = cache.subscribe(resource, move |ev| {
        sink.lock().unwrap().push((ev.event_type, ev.item.raw().identity(), ev.item.model().is_some()));
    });
    (seen, sub)
}

#[tokio::test(start_paused = true)]
async fn concurrent_gets_share_one_list() {
    let t = backend(Some(Duration::from_millis(50)));
    let cache = cache(&t);
    let (core_a, core_b) = (core(), core());
    let (a, b) = tokio::join!(cache.get("pods", Some(&core_a)), cache.get("pods", Some(&core_b)));
    let (a, b) = (a.expect("first"), b.expect("second"));
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.len(), 4);
    assert_eq!(t.count(Verb::Get, PODS), 1);

    // Cached by resource name from here on.
    let c = cache.get("pods", None).await.expect("cached");
    assert!(Arc::ptr_eq(&a, &c));
    assert_eq!(t.count(Verb::Get, PODS), 1);
}

#[tokio::test(start_paused = true)]
async fn events_reach_subscribers_in_order() {
    let t = backend(None);
    let cache = cache(&t);
    let before = cache.get("pods", Some(&core())).await.expect("get");
    let (seen, _sub) = record(&cache, "pods");
    t.wait_for_watch(PODS, 1).await;

    t.push_event(PODS, &WatchEvent::new(EventType::Added, pod_obj("x", "11")));
    t.push_event(PODS, &WatchEvent::ping());
    t.push_event(PODS, &WatchEvent::new(EventType::Modified, pod_obj("x", "12")));
    t.push_event(PODS, &WatchEvent::new(EventType::Deleted, pod_obj("x", "13")));
    settle().await;

    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            (EventType::Added, "ns/x".to_string(), true),
            (EventType::Modified, "ns/x".to_string(), true),
            (EventType::Deleted, "ns/x".to_string(), false),
        ]
    );
    let after = cache.get("pods", None).await.expect("get");
    assert!(after.get("ns/x").is_none());
    assert_eq!(after.len(), 4);
    assert_eq!(after.metadata.resource_version.as_deref(), Some("13"));
    // Readers holding the earlier snapshot never see it change.
    assert_eq!(before.metadata.resource_version.as_deref(), Some("10"));
}

#[tokio::test(start_paused = true)]
async fn workloads_aggregate_pod_restarts() {
    let t = backend(None);
    t.on(
        Verb::Get,
        DEPLOYMENTS,
        json!({
            "apiVersion": "apps/v1", "kind": "DeploymentList", "metadata": { "resourceVersion": "20" },
            "items": [{
                "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "19" },
                "spec": { "replicas": 2, "selector": { "matchLabels": { "app": "web" } },
                          "template": { "spec": { "containers": [{ "name": "c", "image": "nginx" }] } } }
            }]
        }),
    );
    let cache = cache(&t);
    let deployments = cache.get("deployments", Some(&ResourceMeta::base("/apis/apps/v1"))).await.expect("get");
    let web = deployments.get("prod/web").expect("web");
    let workload = web.model().and_then(Model::as_workload).expect("workload model");
    assert_eq!(workload.restarts, 8);
    assert_eq!(web.raw().metadata.relations.as_ref().map(Vec::len), Some(1));

    // The nested pod fetch went through the cache and is reused.
    assert_eq!(t.count(Verb::Get, PODS), 1);
    cache.get("pods", None).await.expect("pods cached");
    assert_eq!(t.count(Verb::Get, PODS), 1);

    let restored = cache.restore_collection(Collection::clone(&deployments));
    assert_eq!(restored.items[0].id, None);
    assert_eq!(restored.items[0].metadata.relations, None);
}

#[tokio::test(start_paused = true)]
async fn get_one_by_identity() {
    let t = backend(None);
    let cache = cache(&t);
    let hit = cache.get_one("pods", Some(&core()), "prod/db-1").await.expect("get_one");
    assert_eq!(hit.map(|i| i.raw().name().to_string()), Some("db-1".to_string()));
    assert_eq!(cache.get_one("pods", Some(&core()), "prod/missing").await, Ok(None));

    let err = cache.get_one("widgets", Some(&core()), "x").await.expect_err("unknown resource");
    assert!(matches!(err, Error::UnrecognizedResource { .. }), "{err}");
}

#[tokio::test(start_paused = true)]
async fn cancelling_an_in_flight_fetch() {
    let t = backend(Some(Duration::from_secs(1)));
    let cache = cache(&t);
    let c2 = cache.clone();
    let pending = tokio::spawn(async move { c2.get("pods", Some(&core())).await });
    settle().await;
    cache.cancel_queries(Some(&["pods"]));
    assert_eq!(pending.await.expect("join"), Err(Error::Cancelled));
    assert_eq!(t.count(Verb::Get, PODS), 0);

    let again = cache.get("pods", Some(&core())).await.expect("fresh fetch");
    assert_eq!(again.len(), 4);
    assert_eq!(t.count(Verb::Get, PODS), 1);
}

#[tokio::test(start_paused = true)]
async fn destroy_is_terminal_and_idempotent() {
    let t = backend(None);
    let cache = cache(&t);
    cache.get("pods", Some(&core())).await.expect("get");
    let (seen, _sub) = record(&cache, "pods");
    t.wait_for_watch(PODS, 1).await;

    cache.destroy();
    cache.destroy();
    settle().await;

    assert!(cache.is_destroyed());
    assert_eq!(cache.get("pods", Some(&core())).await, Err(Error::StoreDestroyed));
    assert!(!t.push_event(PODS, &WatchEvent::new(EventType::Added, pod_obj("late", "30"))));
    cache.publish("pods", WatchEvent::new(EventType::Added, pod_obj("late", "30"))).await.expect("publish");
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn publish_reflects_locally_and_unsubscribe_stops_callbacks() {
    let t = backend(None);
    let cache = cache(&t);
    cache.get("pods", Some(&core())).await.expect("get");
    let (seen, sub) = record(&cache, "pods");

    cache.publish("pods", WatchEvent::ping()).await.expect("ping");
    cache.publish("pods", WatchEvent::new(EventType::Added, pod_obj("s", "40"))).await.expect("add");
    assert_eq!(*seen.lock().unwrap(), vec![(EventType::Added, "ns/s".to_string(), true)]);
    assert!(cache.get("pods", None).await.expect("get").get("ns/s").is_some());

    sub.unsubscribe();
    cache.publish("pods", WatchEvent::new(EventType::Deleted, pod_obj("s", "41"))).await.expect("delete");
    assert_eq!(seen.lock().unwrap().len(), 1);
    assert!(cache.get("pods", None).await.expect("get").get("ns/s").is_none());
}

#[tokio::test(start_paused = true)]
async fn local_create_notifies_once_despite_network_echo() {
    let t = backend(None);
    t.on(Verb::Get, CONFIGMAPS, json!({ "apiVersion": "v1", "kind": "ConfigMapList", "metadata": { "resourceVersion": "1" }, "items": [] }));
    let created = json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": "cfg", "namespace": "default", "resourceVersion": "5" },
        "data": { "k": "v" }
    });
    t.on(Verb::Post, "http://m/api/v1/namespaces/default/configmaps", created.clone());
    let cache = cache(&t);
    cache.get("configmaps", Some(&core())).await.expect("get");
    let events: Arc<Mutex<Vec<Option<LiveEvent>>>> = Arc::default();
    let sink = events.clone();
    let _sub = cache.subscribe("configmaps", move |ev| sink.lock().unwrap().push(ev.live()));
    t.wait_for_watch(CONFIGMAPS, 1).await;

    let spec = Unstructured::from_value(json!({ "kind": "ConfigMap", "metadata": { "name": "cfg" }, "data": { "k": "v" } }))
        .expect("spec");
    let out = cache.mutation_client().create([spec]).await.expect("create");
    assert_eq!(out[0].raw().identity(), "default/cfg");
    settle().await;
    assert_eq!(*events.lock().unwrap(), vec![Some(LiveEvent::Created)]);

    let echo = Unstructured::from_value(created).expect("echo");
    t.push_event(CONFIGMAPS, &WatchEvent::new(EventType::Added, echo.clone()));
    settle().await;
    assert_eq!(events.lock().unwrap().len(), 1);

    let mut changed = echo;
    changed.metadata.resource_version = Some("6".into());
    t.push_event(CONFIGMAPS, &WatchEvent::new(EventType::Modified, changed));
    settle().await;
    assert_eq!(*events.lock().unwrap(), vec![Some(LiveEvent::Created), Some(LiveEvent::Updated)]);
    assert_eq!(cache.get("configmaps", None).await.expect("get").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn cached_models_written_back_lose_injected_fields() {
    let t = backend(None);
    let deployment = json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": { "name": "web", "namespace": "prod", "resourceVersion": "19" },
        "spec": { "replicas": 2, "selector": { "matchLabels": { "app": "web" } } }
    });
    t.on(
        Verb::Get,
        DEPLOYMENTS,
        json!({ "apiVersion": "apps/v1", "kind": "DeploymentList", "metadata": { "resourceVersion": "20" }, "items": [deployment.clone()] }),
    );
    t.on(Verb::Post, "http://m/apis/apps/v1/namespaces/prod/deployments", deployment);
    let mut web_1 = pod("prod", "web-1", "web", 5);
    web_1["apiVersion"] = json!("v1");
    web_1["kind"] = json!("Pod");
    t.on(Verb::Post, "http://m/api/v1/namespaces/prod/pods", web_1);
    let cache = cache(&t);

    let deployments = cache.get("deployments", Some(&ResourceMeta::base("/apis/apps/v1"))).await.expect("deployments");
    let pods = cache.get("pods", None).await.expect("pods");
    let web = deployments.get("prod/web").cloned().expect("web");
    let pod = pods.get("prod/web-1").cloned().expect("web-1");
    assert!(web.model().is_some() && pod.model().is_some());
    assert!(web.raw().metadata.relations.is_some());

    let out = cache.mutation_client().create([web, pod]).await.expect("create");
    let posts: Vec<Value> =
        t.requests().into_iter().filter(|r| r.verb == Verb::Post).filter_map(|r| r.body).collect();
    assert_eq!(posts.len(), 2);
    for body in &posts {
        assert!(body.get("id").is_none(), "{body}");
        assert!(body.pointer("/metadata/relations").is_none(), "{body}");
    }
    // Replies come back through the same pipeline as cached items.
    assert!(out.iter().all(|i| i.model().is_some()));
    assert_eq!(out[0].raw().metadata.relations.as_ref().map(Vec::len), Some(1));
}

#[tokio::test(start_paused = true)]
async fn racing_fetches_under_two_bases_keep_one_session() {
    let t = backend(Some(Duration::from_millis(50)));
    t.on(
        Verb::Get,
        "http://m/apis/metrics.k8s.io/v1beta1",
        json!({ "resources": [{ "name": "pods", "namespaced": true, "kind": "PodMetrics", "verbs": ["list", "watch"] }] }),
    );
    t.on(
        Verb::Get,
        POD_METRICS,
        json!({ "apiVersion": "metrics.k8s.io/v1beta1", "kind": "PodMetricsList", "metadata": { "resourceVersion": "3" }, "items": [] }),
    );
    let cache = cache(&t);
    let metrics = ResourceMeta::base("/apis/metrics.k8s.io/v1beta1");
    let core_meta = core();
    let (a, b) = tokio::join!(cache.get("pods", Some(&core_meta)), cache.get("pods", Some(&metrics)));
    let (a, b) = (a.expect("core pods"), b.expect("pod metrics"));
    assert!(Arc::ptr_eq(&a, &b));
    tokio::time::sleep(Duration::from_secs(1)).await;

    let live = |t: &MockTransport| [PODS, POD_METRICS].iter().filter(|u| t.push_event(u, &WatchEvent::ping())).count();
    assert_eq!(live(&t), 1);

    cache.cancel_queries(Some(&["pods"]));
    settle().await;
    assert_eq!(live(&t), 0);
}
