//! Identity codec: maps `(cluster, native name)` to the externally visible unique name
//! and back.
//!
//! Wire format (stable): `"<clusterID>:<nativeName>"`. Namespaced resources are
//! additionally addressable as `"<namespace>/<clusterID>:<nativeName>"`.
//! Cluster identifiers are DNS-1123 subdomains and never contain `:`, so the first
//! separator in a unique name is always the cluster boundary, even when the native
//! name itself contains `:`.

use kube::Resource;

use crate::{AggregateError, AggregateResult, ClusterId};

pub const UNIQUE_NAME_SEPARATOR: char = ':';

/// Annotation stamped on every translated copy naming the member cluster it came from.
pub const SOURCE_CLUSTER_ANNOTATION: &str = "meridian.io/source-cluster";

pub fn gen_unique_name(cluster: &ClusterId, native_name: &str) -> String {
    let mut out = String::with_capacity(cluster.as_str().len() + 1 + native_name.len());
    out.push_str(cluster.as_str());
    out.push(UNIQUE_NAME_SEPARATOR);
    out.push_str(native_name);
    out
}

/// Rewrite the identity of `obj` so it is unique across member clusters.
///
/// Must only be applied to a private copy, never to an object shared with a cache.
pub fn make_unique<K: Resource>(obj: &mut K, cluster: &ClusterId) {
    let meta = obj.meta_mut();
    let native = meta.name.as_deref().unwrap_or_default();
    meta.name = Some(gen_unique_name(cluster, native));
    meta.annotations
        .get_or_insert_with(Default::default)
        .insert(SOURCE_CLUSTER_ANNOTATION.to_string(), cluster.to_string());
}

/// Copy-on-read variant of [`make_unique`].
pub fn unique_copy<K: Resource + Clone>(obj: &K, cluster: &ClusterId) -> K {
    let mut copy = obj.clone();
    make_unique(&mut copy, cluster);
    copy
}

/// Split a unique name into its `(cluster, native name)` parts without consulting
/// the registry. Returns `None` when the name was not produced by this codec.
pub fn split_unique_name(unique: &str) -> Option<(&str, &str)> {
    let (cluster, native) = unique.split_once(UNIQUE_NAME_SEPARATOR)?;
    if cluster.is_empty() || native.is_empty() {
        return None;
    }
    Some((cluster, native))
}

/// Candidate source clusters for `unique`, in the order of `clusters`.
///
/// Every cluster whose identifier decomposes `unique` is returned so callers can try
/// them in a stable sequence; with valid identifiers this is at most one entry.
pub fn possible_clusters<C: AsRef<ClusterId>>(clusters: &[C], unique: &str) -> Vec<ClusterId> {
    clusters
        .iter()
        .map(AsRef::as_ref)
        .filter(|id| {
            unique
                .strip_prefix(id.as_str())
                .and_then(|rest| rest.strip_prefix(UNIQUE_NAME_SEPARATOR))
                .is_some_and(|native| !native.is_empty())
        })
        .cloned()
        .collect()
}

/// The member cluster a translated copy came from, if it carries the annotation.
pub fn source_cluster<K: Resource>(obj: &K) -> Option<&str> {
    obj.meta().annotations.as_ref()?.get(SOURCE_CLUSTER_ANNOTATION).map(String::as_str)
}

/// Split a single-string namespaced address `"<namespace>/<name>"`.
pub fn split_qualified_name(qualified: &str) -> AggregateResult<(&str, &str)> {
    match qualified.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => Ok((ns, name)),
        _ => Err(AggregateError::bad_request(format!("invalid name {qualified:?}: expected \"<namespace>/<name>\""))),
    }
}
