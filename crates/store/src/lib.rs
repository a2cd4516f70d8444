//! Meridian store: aggregated lister over every ready member cluster.
//!
//! Reads are served from the per-cluster caches of the registry. Clusters whose
//! cache is missing, unsynced or failing are skipped; only a failure to enumerate
//! ready clusters fails the call.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use kube::Resource;
use meridian_core::identity::{gen_unique_name, possible_clusters, split_qualified_name, unique_copy};
use meridian_core::{AggregateError, AggregateResult, ClusterId, ClusterRef, LabelSelector, ResourceDescriptor};
use meridian_kubehub::{CachedLister, ClusterRegistry};
use tracing::{debug, trace};

/// Why a cluster did not contribute to an aggregated read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Skip {
    NoLister,
    NotSynced,
    ListError,
}

impl Skip {
    fn as_str(self) -> &'static str {
        match self {
            Skip::NoLister => "no_lister",
            Skip::NotSynced => "not_synced",
            Skip::ListError => "list_error",
        }
    }
}

fn skipped(cluster: &ClusterId, reason: Skip) {
    debug!(cluster = %cluster, reason = reason.as_str(), "cluster skipped");
    metrics::counter!("meridian_cluster_skipped_total", 1u64, "reason" => reason.as_str());
}

/// Lister for kind `K` merging the caches of all ready member clusters.
pub struct AggregatedLister<K> {
    registry: Arc<dyn ClusterRegistry<K>>,
    descriptor: ResourceDescriptor,
}

impl<K> Clone for AggregatedLister<K> {
    fn clone(&self) -> Self {
        Self { registry: Arc::clone(&self.registry), descriptor: self.descriptor.clone() }
    }
}

impl<K> AggregatedLister<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<dyn ClusterRegistry<K>>, descriptor: ResourceDescriptor) -> Self {
        Self { registry, descriptor }
    }

    pub fn descriptor(&self) -> &ResourceDescriptor { &self.descriptor }

    pub fn registry(&self) -> &Arc<dyn ClusterRegistry<K>> { &self.registry }

    /// Objects across all namespaces and clusters, in cluster order then cache order.
    pub fn list(&self, selector: &LabelSelector) -> AggregateResult<Vec<K>> {
        self.list_in(None, selector)
    }

    /// Get by external name: `"<namespace>/<unique>"` for namespaced kinds, the bare
    /// unique name otherwise.
    pub fn get(&self, name: &str) -> AggregateResult<K> {
        if self.descriptor.namespaced {
            let (ns, unique) = split_qualified_name(name)?;
            self.by_namespace(ns).get(unique)
        } else {
            self.get_in(None, name)
        }
    }

    pub fn by_namespace<'a>(&'a self, namespace: &'a str) -> NamespaceLister<'a, K> {
        NamespaceLister { parent: self, namespace }
    }

    fn ready(&self) -> AggregateResult<Vec<ClusterRef>> {
        self.registry.ready_clusters().map_err(AggregateError::registry)
    }

    fn usable_lister(&self, cluster: &ClusterId) -> Option<Arc<dyn CachedLister<K>>> {
        let Some(lister) = self.registry.lister_for(cluster) else {
            skipped(cluster, Skip::NoLister);
            return None;
        };
        if !lister.has_synced() {
            skipped(cluster, Skip::NotSynced);
            return None;
        }
        Some(lister)
    }

    fn list_in(&self, namespace: Option<&str>, selector: &LabelSelector) -> AggregateResult<Vec<K>> {
        let t0 = Instant::now();
        let clusters = self.ready()?;
        let mut out = Vec::new();
        for c in &clusters {
            let Some(lister) = self.usable_lister(&c.id) else { continue };
            match lister.list(namespace, selector) {
                Ok(objs) => {
                    trace!(cluster = %c.id, count = objs.len(), "cluster listed");
                    out.extend(objs.iter().map(|o| unique_copy(o.as_ref(), &c.id)));
                }
                Err(e) => {
                    debug!(cluster = %c.id, error = %format!("{e:#}"), "list failed");
                    skipped(&c.id, Skip::ListError);
                }
            }
        }
        let took = t0.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("meridian_list_ms", took);
        debug!(
            resource = %self.descriptor.group_resource(),
            namespace = ?namespace,
            clusters = clusters.len(),
            items = out.len(),
            took_ms = %format!("{took:.1}"),
            "aggregated list"
        );
        Ok(out)
    }

    fn get_in(&self, namespace: Option<&str>, unique: &str) -> AggregateResult<K> {
        let clusters = self.ready()?;
        for cluster in possible_clusters(clusters.as_slice(), unique) {
            let Some(lister) = self.usable_lister(&cluster) else { continue };
            let objs = match lister.list(namespace, &LabelSelector::everything()) {
                Ok(objs) => objs,
                Err(e) => {
                    debug!(cluster = %cluster, error = %format!("{e:#}"), "list failed");
                    skipped(&cluster, Skip::ListError);
                    continue;
                }
            };
            let hit = objs.iter().find(|o| {
                o.meta().name.as_deref().is_some_and(|native| gen_unique_name(&cluster, native) == unique)
            });
            if let Some(obj) = hit {
                return Ok(unique_copy(obj.as_ref(), &cluster));
            }
        }
        Err(AggregateError::not_found(self.descriptor.group_resource(), unique))
    }
}

/// Aggregated reads scoped to one external namespace.
pub struct NamespaceLister<'a, K> {
    parent: &'a AggregatedLister<K>,
    namespace: &'a str,
}

impl<K> NamespaceLister<'_, K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn list(&self, selector: &LabelSelector) -> AggregateResult<Vec<K>> {
        self.parent.list_in(Some(self.namespace), selector)
    }

    /// Get by unique name; candidate clusters are tried in enumeration order.
    pub fn get(&self, unique: &str) -> AggregateResult<K> {
        self.parent.get_in(Some(self.namespace), unique)
    }
}
