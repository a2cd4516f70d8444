use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Service;
use kube::api::ObjectMeta;
use meridian_core::identity::{source_cluster, SOURCE_CLUSTER_ANNOTATION};
use meridian_core::{ClusterId, WatchEvent, WatchStatus};
use meridian_kubehub::{ClusterRegistry, FanIn, FanInConfig, MemoryRegistry, SessionPhase, WatchRequest};
use tokio::time::timeout;

const LIVENESS: Duration = Duration::from_secs(5);

fn id(s: &str) -> ClusterId { ClusterId::new(s).unwrap() }

fn svc(ns: &str, name: &str) -> Service {
    Service {
        metadata: ObjectMeta { name: Some(name.into()), namespace: Some(ns.into()), ..Default::default() },
        ..Default::default()
    }
}

fn name_of(ev: &WatchEvent<Service>) -> String {
    ev.object().and_then(|o| o.metadata.name.clone()).unwrap_or_default()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn events_are_relabelled_with_source_cluster() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let b = reg.attach_watch(&id("b"));
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();

    a.send(WatchEvent::Added(svc("x", "svc1"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(ev.type_name(), "ADDED");
    assert_eq!(name_of(&ev), "a:svc1");
    assert_eq!(ev.object().and_then(source_cluster), Some("a"));

    b.send(WatchEvent::Modified(svc("x", "svc1"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(name_of(&ev), "b:svc1");
    assert_eq!(ev.object().unwrap().metadata.namespace.as_deref(), Some("x"));
    assert!(ev.object().unwrap().metadata.annotations.as_ref().unwrap().contains_key(SOURCE_CLUSTER_ANNOTATION));

    let status = WatchStatus { code: 410, reason: "Expired".into(), message: "too old".into() };
    a.send(WatchEvent::Error(status.clone())).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(ev, WatchEvent::Error(status));

    w.shutdown().await;
    assert_eq!(w.stats().forwarded, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn first_upstream_close_closes_outward_stream_once() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let b = reg.attach_watch(&id("b"));
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();

    b.send(WatchEvent::Added(svc("x", "before"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(name_of(&ev), "b:before");

    drop(a);
    // Stream ends even though b is still live.
    let end = timeout(LIVENESS, async {
        let mut rest = Vec::new();
        while let Some(ev) = w.next().await {
            rest.push(ev);
        }
        rest
    })
    .await
    .unwrap();
    assert!(end.is_empty());

    // The surviving upstream was cancelled: its feed receiver is gone.
    timeout(LIVENESS, b.closed()).await.unwrap();
    assert!(b.send(WatchEvent::Added(svc("x", "after"))).await.is_err());

    w.shutdown().await;
    w.stop();
    let stats = w.stats();
    assert_eq!(stats.closes, 1);
    assert_eq!(stats.forwarded, 1);
    assert_eq!(w.phase(), SessionPhase::Closed);
    assert_eq!(w.live_workers(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_before_any_event_stops_every_worker() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let b = reg.attach_watch(&id("b"));
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();
    assert_eq!(w.phase(), SessionPhase::Streaming);

    w.stop();
    w.stop();
    timeout(LIVENESS, w.shutdown()).await.unwrap();

    assert_eq!(w.live_workers(), 0);
    assert_eq!(w.phase(), SessionPhase::Closed);
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(timeout(LIVENESS, w.next()).await.unwrap().is_none());
    let stats = w.stats();
    assert_eq!(stats.forwarded, 0);
    assert_eq!(stats.closes, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropping_the_handle_cancels_upstreams() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();
    drop(w);
    timeout(LIVENESS, a.closed()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn survivors_keep_streaming_when_configured() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let b = reg.attach_watch(&id("b"));
    let cfg = FanInConfig { terminate_on_first_close: false, ..FanInConfig::default() };
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &cfg)
        .await
        .unwrap();

    drop(a);
    b.send(WatchEvent::Added(svc("x", "late"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(name_of(&ev), "b:late");
    assert_eq!(w.phase(), SessionPhase::Streaming);

    drop(b);
    assert!(timeout(LIVENESS, w.next()).await.unwrap().is_none());
    w.shutdown().await;
    assert_eq!(w.stats().closes, 1);
}

#[tokio::test]
async fn no_upstream_yields_empty_closed_stream() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    reg.add_cluster(&id("a"), true);
    reg.add_cluster(&id("b"), true);
    reg.fail_watch(&id("b"));
    let w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();
    let events: Vec<_> = timeout(LIVENESS, w.collect::<Vec<_>>()).await.unwrap();
    assert!(events.is_empty());
}

#[tokio::test]
async fn unready_and_failing_clusters_are_skipped() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let _down = reg.attach_watch(&id("down"));
    reg.add_cluster(&id("down"), false);
    reg.fail_watch(&id("broken"));

    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .unwrap();
    assert_eq!(w.live_workers(), 1);
    assert!(reg.watch_requests(&id("down")).is_empty());
    assert_eq!(reg.watch_requests(&id("broken")).len(), 1);

    a.send(WatchEvent::Deleted(svc("x", "gone"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(ev.type_name(), "DELETED");
    assert_eq!(name_of(&ev), "a:gone");
    w.shutdown().await;
}

#[tokio::test]
async fn upstream_request_carries_scope_and_default_timeout() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let _a = reg.attach_watch(&id("a"));
    let req = WatchRequest {
        namespace: Some("x".into()),
        labels: "app=web".parse().unwrap(),
        fields: "metadata.namespace=x,metadata.name!=b:db".parse().unwrap(),
        ..Default::default()
    };
    let cfg = FanInConfig { watch_timeout: Duration::from_secs(600), ..FanInConfig::default() };
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, req, &cfg).await.unwrap();
    let seen = reg.watch_requests(&id("a"));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].namespace.as_deref(), Some("x"));
    assert_eq!(seen[0].labels.to_string(), "app=web");
    assert_eq!(seen[0].fields.to_string(), "metadata.namespace=x");
    assert_eq!(seen[0].timeout, Some(Duration::from_secs(600)));
    w.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn name_field_selector_targets_one_cluster() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let _b = reg.attach_watch(&id("b"));
    let req = WatchRequest { fields: "metadata.name=a:svc1".parse().unwrap(), ..Default::default() };
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, req, &FanInConfig::default())
        .await
        .unwrap();
    assert_eq!(reg.watch_requests(&id("a"))[0].fields.to_string(), "metadata.name=svc1");
    assert!(reg.watch_requests(&id("b")).is_empty());
    assert_eq!(w.live_workers(), 1);

    // the in-memory upstream ignores field selectors; the session still filters
    a.send(WatchEvent::Added(svc("x", "other"))).await.unwrap();
    a.send(WatchEvent::Added(svc("x", "svc1"))).await.unwrap();
    let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
    assert_eq!(name_of(&ev), "a:svc1");

    drop(a);
    let rest: Vec<_> = timeout(LIVENESS, (&mut w).collect::<Vec<_>>()).await.unwrap();
    assert!(rest.is_empty());
    assert_eq!(w.stats().forwarded, 1);
    w.shutdown().await;
}

#[tokio::test]
async fn registry_failure_is_fatal() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let _a = reg.attach_watch(&id("a"));
    reg.fail_enumeration(Some("registry offline"));
    let err = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &FanInConfig::default())
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("registry offline"), "{err}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_consumer_applies_backpressure_without_loss() {
    let reg = Arc::new(MemoryRegistry::<Service>::new());
    let a = reg.attach_watch(&id("a"));
    let cfg = FanInConfig { sink_capacity: 1, ..FanInConfig::default() };
    let mut w = FanIn::start(reg.clone() as Arc<dyn ClusterRegistry<Service>>, WatchRequest::default(), &cfg).await.unwrap();

    let producer = tokio::spawn(async move {
        for i in 0..20 {
            a.send(WatchEvent::Added(svc("x", &format!("s{i}")))).await.unwrap();
        }
        a
    });
    let mut names = Vec::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(2)).await;
        let ev = timeout(LIVENESS, w.next()).await.unwrap().unwrap();
        names.push(name_of(&ev));
    }
    let expected: Vec<String> = (0..20).map(|i| format!("a:s{i}")).collect();
    assert_eq!(names, expected);
    let _a = producer.await.unwrap();
    w.shutdown().await;
    assert_eq!(w.stats().forwarded, 20);
}
