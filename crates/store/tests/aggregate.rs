use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::ObjectMeta;
use meridian_core::identity::source_cluster;
use meridian_core::{ClusterId, LabelSelector, ResourceDescriptor};
use meridian_kubehub::{ClusterRegistry, MemoryRegistry};
use meridian_store::AggregatedLister;

fn id(s: &str) -> ClusterId { ClusterId::new(s).unwrap() }

fn svc(ns: &str, name: &str, labels: &[(&str, &str)]) -> Service {
    let labels: BTreeMap<String, String> = labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    Service {
        metadata: ObjectMeta {
            name: Some(name.into()),
            namespace: Some(ns.into()),
            labels: (!labels.is_empty()).then_some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn two_clusters() -> Arc<MemoryRegistry<Service>> {
    let reg = Arc::new(MemoryRegistry::new());
    reg.insert(&id("a"), svc("x", "svc1", &[("app", "web")]));
    reg.insert(&id("b"), svc("x", "svc1", &[("app", "web")]));
    reg.insert(&id("b"), svc("y", "svc2", &[("app", "db")]));
    reg
}

fn lister(reg: &Arc<MemoryRegistry<Service>>) -> AggregatedLister<Service> {
    AggregatedLister::new(Arc::clone(reg) as Arc<dyn ClusterRegistry<Service>>, ResourceDescriptor::of::<Service>(true))
}

fn names(objs: &[Service]) -> Vec<String> {
    objs.iter().map(|o| o.metadata.name.clone().unwrap_or_default()).collect()
}

#[test]
fn colliding_names_become_distinct_and_traceable() {
    let reg = two_clusters();
    let l = lister(&reg);
    let got = l.by_namespace("x").list(&LabelSelector::everything()).unwrap();
    assert_eq!(names(&got), ["a:svc1", "b:svc1"]);
    let unique: HashSet<_> = names(&got).into_iter().collect();
    assert_eq!(unique.len(), 2);
    let origins: Vec<_> = got.iter().map(|o| source_cluster(o).unwrap().to_string()).collect();
    assert_eq!(origins, ["a", "b"]);
}

#[test]
fn list_all_namespaces_in_cluster_order_with_selector() {
    let reg = two_clusters();
    let l = lister(&reg);
    assert_eq!(names(&l.list(&LabelSelector::everything()).unwrap()), ["a:svc1", "b:svc1", "b:svc2"]);
    let web: LabelSelector = "app=web".parse().unwrap();
    assert_eq!(names(&l.list(&web).unwrap()), ["a:svc1", "b:svc1"]);
}

#[test]
fn cached_objects_are_never_mutated() {
    let reg = two_clusters();
    let l = lister(&reg);
    let _ = l.list(&LabelSelector::everything()).unwrap();
    let _ = l.get("x/a:svc1").unwrap();
    let cached = reg.lister_for(&id("a")).unwrap().list(None, &LabelSelector::everything()).unwrap();
    assert_eq!(cached[0].metadata.name.as_deref(), Some("svc1"));
    assert!(cached[0].metadata.annotations.is_none());
}

#[test]
fn unsynced_missing_and_failing_clusters_are_skipped() {
    let reg = two_clusters();
    reg.set_synced(&id("b"), false);
    reg.add_cluster(&id("bare"), true);
    reg.insert(&id("flaky"), svc("x", "svc9", &[]));
    reg.fail_list(&id("flaky"), true);
    reg.insert(&id("down"), svc("x", "svc8", &[]));
    reg.add_cluster(&id("down"), false);

    let l = lister(&reg);
    let got = l.by_namespace("x").list(&LabelSelector::everything()).unwrap();
    assert_eq!(names(&got), ["a:svc1"]);

    reg.set_synced(&id("b"), true);
    reg.remove_lister(&id("a"));
    assert_eq!(names(&l.list(&LabelSelector::everything()).unwrap()), ["b:svc1", "b:svc2"]);
}

#[test]
fn get_resolves_the_right_cluster() {
    let reg = two_clusters();
    let l = lister(&reg);
    let obj = l.get("x/b:svc1").unwrap();
    assert_eq!(obj.metadata.name.as_deref(), Some("b:svc1"));
    assert_eq!(source_cluster(&obj), Some("b"));
    let obj = l.by_namespace("x").get("a:svc1").unwrap();
    assert_eq!(source_cluster(&obj), Some("a"));
}

#[test]
fn get_missing_is_typed_not_found() {
    let reg = two_clusters();
    let l = lister(&reg);
    for name in ["x/doesnotexist", "x/a:nope", "y/a:svc1", "x/zz:svc1"] {
        let err = l.get(name).unwrap_err();
        assert!(err.is_not_found(), "{name}: {err}");
    }
    let err = l.get("x/doesnotexist").unwrap_err();
    assert_eq!(err.to_string(), "services \"doesnotexist\" not found");
}

#[test]
fn get_skips_unsynced_source_cluster() {
    let reg = two_clusters();
    reg.set_synced(&id("b"), false);
    let l = lister(&reg);
    assert!(l.get("x/b:svc1").unwrap_err().is_not_found());
}

#[test]
fn malformed_qualified_names_are_bad_requests() {
    let reg = two_clusters();
    let l = lister(&reg);
    for name in ["a:svc1", "/a:svc1", "x/", "x/a:svc1/extra"] {
        let err = l.get(name).unwrap_err();
        assert!(err.is_bad_request(), "{name}: {err}");
    }
}

#[test]
fn registry_failure_is_fatal() {
    let reg = two_clusters();
    reg.fail_enumeration(Some("etcd unavailable"));
    let l = lister(&reg);
    let err = l.list(&LabelSelector::everything()).unwrap_err();
    assert!(!err.is_not_found());
    assert!(err.to_string().contains("etcd unavailable"));
    assert!(l.get("x/a:svc1").is_err());
}

#[test]
fn cluster_scoped_get_uses_bare_unique_name() {
    let reg = Arc::new(MemoryRegistry::<Namespace>::new());
    let ns = Namespace { metadata: ObjectMeta { name: Some("team".into()), ..Default::default() }, ..Default::default() };
    reg.insert(&id("a"), ns.clone());
    reg.insert(&id("b"), ns);
    let l = AggregatedLister::new(
        Arc::clone(&reg) as Arc<dyn ClusterRegistry<Namespace>>,
        ResourceDescriptor::of::<Namespace>(false),
    );
    let got = l.get("b:team").unwrap();
    assert_eq!(source_cluster(&got), Some("b"));
    assert!(l.get("team").unwrap_err().is_not_found());
}
