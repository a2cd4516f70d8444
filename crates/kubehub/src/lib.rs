//! Meridian kubehub – member cluster registry, upstream watches and watch fan-in.
//!
//! The registry is consumed through typed, per-kind interfaces: an aggregated
//! reader for kind `K` holds an `Arc<dyn ClusterRegistry<K>>` resolved once at
//! construction and never inspects listers or objects dynamically.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream::BoxStream;
use meridian_core::{ClusterId, ClusterRef, FieldSelector, LabelSelector, WatchEvent};

pub mod fanin;
pub mod live;
pub mod memory;

pub use fanin::{FanIn, FanInConfig, FanInStats, ProxyWatch, SessionPhase};
pub use live::{KindInformers, KubeRegistry};
pub use memory::MemoryRegistry;

/// Upstream watch stream of one member cluster. Ends when the upstream closes.
pub type UpstreamStream<K> = BoxStream<'static, WatchEvent<K>>;

/// Read access to one cluster's local cache for kind `K`.
pub trait CachedLister<K>: Send + Sync {
    /// Whether the initial full sync of the cache has completed.
    fn has_synced(&self) -> bool;

    /// Objects in `namespace` (all namespaces when `None`) matching `selector`.
    /// Returned objects are shared with the cache and must not be mutated.
    fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Arc<K>>>;
}

/// Parameters of one upstream watch call.
#[derive(Debug, Clone, Default)]
pub struct WatchRequest {
    pub namespace: Option<String>,
    pub labels: LabelSelector,
    pub fields: FieldSelector,
    pub timeout: Option<Duration>,
}

/// Live client able to open watches for kind `K` against one cluster.
#[async_trait::async_trait]
pub trait WatchClient<K>: Send + Sync {
    async fn watch(&self, req: &WatchRequest) -> Result<UpstreamStream<K>>;
}

/// The set of member clusters as seen for one resource kind.
pub trait ClusterRegistry<K>: Send + Sync {
    /// Snapshot of the currently ready clusters, in stable enumeration order.
    fn ready_clusters(&self) -> Result<Vec<ClusterRef>>;

    fn lister_for(&self, cluster: &ClusterId) -> Option<Arc<dyn CachedLister<K>>>;

    fn client_for(&self, cluster: &ClusterId) -> Option<Arc<dyn WatchClient<K>>>;
}
