//! In-process registry backed by plain vectors and channel-fed watches.
//!
//! Used by tests and demos in place of live member clusters; every failure mode
//! the aggregation layer has to tolerate can be injected per cluster.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use anyhow::{anyhow, Result};
use futures::StreamExt;
use kube::Resource;
use meridian_core::{ClusterId, ClusterRef, LabelSelector, WatchEvent};
use tokio::sync::mpsc;

use crate::{CachedLister, ClusterRegistry, UpstreamStream, WatchClient, WatchRequest};

const FEED_CAPACITY: usize = 64;

pub struct MemoryCache<K> {
    objects: RwLock<Vec<Arc<K>>>,
    synced: AtomicBool,
    fail_list: AtomicBool,
}

impl<K> MemoryCache<K> {
    fn new() -> Self {
        Self { objects: RwLock::new(Vec::new()), synced: AtomicBool::new(true), fail_list: AtomicBool::new(false) }
    }
}

impl<K: Resource + Send + Sync> CachedLister<K> for MemoryCache<K> {
    fn has_synced(&self) -> bool { self.synced.load(Ordering::SeqCst) }

    fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Arc<K>>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(anyhow!("injected list failure"));
        }
        let objects = self.objects.read().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .iter()
            .filter(|o| namespace.map_or(true, |ns| o.meta().namespace.as_deref() == Some(ns)))
            .filter(|o| selector.matches_object(o.as_ref()))
            .cloned()
            .collect())
    }
}

pub struct MemoryWatchClient<K> {
    feeds: Mutex<VecDeque<mpsc::Receiver<WatchEvent<K>>>>,
    requests: Mutex<Vec<WatchRequest>>,
    fail: AtomicBool,
}

impl<K> MemoryWatchClient<K> {
    fn new() -> Self {
        Self { feeds: Mutex::new(VecDeque::new()), requests: Mutex::new(Vec::new()), fail: AtomicBool::new(false) }
    }
}

#[async_trait::async_trait]
impl<K: Send + 'static> WatchClient<K> for MemoryWatchClient<K> {
    async fn watch(&self, req: &WatchRequest) -> Result<UpstreamStream<K>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).push(req.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("injected watch failure"));
        }
        let rx = self
            .feeds
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .ok_or_else(|| anyhow!("no watch feed attached"))?;
        Ok(futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) }).boxed())
    }
}

struct MemoryCluster<K> {
    id: ClusterId,
    ready: bool,
    cache: Option<Arc<MemoryCache<K>>>,
    client: Option<Arc<MemoryWatchClient<K>>>,
}

struct MemoryState<K> {
    clusters: Vec<MemoryCluster<K>>,
    enumeration_error: Option<String>,
}

/// Registry of fake member clusters for kind `K`.
pub struct MemoryRegistry<K> {
    state: RwLock<MemoryState<K>>,
}

impl<K> Default for MemoryRegistry<K> {
    fn default() -> Self {
        Self { state: RwLock::new(MemoryState { clusters: Vec::new(), enumeration_error: None }) }
    }
}

impl<K: Resource + Send + Sync + 'static> MemoryRegistry<K> {
    pub fn new() -> Self { Self::default() }

    fn with_cluster<R>(&self, id: &ClusterId, f: impl FnOnce(&mut MemoryCluster<K>) -> R) -> R {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let pos = match state.clusters.iter().position(|c| &c.id == id) {
            Some(pos) => pos,
            None => {
                state.clusters.push(MemoryCluster { id: id.clone(), ready: true, cache: None, client: None });
                state.clusters.len() - 1
            }
        };
        f(&mut state.clusters[pos])
    }

    fn cache(&self, id: &ClusterId) -> Arc<MemoryCache<K>> {
        self.with_cluster(id, |c| Arc::clone(c.cache.get_or_insert_with(|| Arc::new(MemoryCache::new()))))
    }

    fn client(&self, id: &ClusterId) -> Arc<MemoryWatchClient<K>> {
        self.with_cluster(id, |c| Arc::clone(c.client.get_or_insert_with(|| Arc::new(MemoryWatchClient::new()))))
    }

    /// Register a cluster (no lister, no client) or update its readiness.
    pub fn add_cluster(&self, id: &ClusterId, ready: bool) {
        self.with_cluster(id, |c| c.ready = ready);
    }

    /// Store `obj` in the cluster's cache, creating a synced cache on first use.
    pub fn insert(&self, id: &ClusterId, obj: K) {
        let cache = self.cache(id);
        cache.objects.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(obj));
    }

    pub fn set_synced(&self, id: &ClusterId, synced: bool) {
        self.cache(id).synced.store(synced, Ordering::SeqCst);
    }

    pub fn fail_list(&self, id: &ClusterId, fail: bool) {
        self.cache(id).fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn remove_lister(&self, id: &ClusterId) {
        self.with_cluster(id, |c| c.cache = None);
    }

    /// Make `ready_clusters` fail with `msg` (or succeed again with `None`).
    pub fn fail_enumeration(&self, msg: Option<&str>) {
        self.state.write().unwrap_or_else(PoisonError::into_inner).enumeration_error = msg.map(str::to_string);
    }

    /// Queue a feed for the next upstream watch opened against `id`.
    /// Dropping the returned sender ends that upstream stream.
    pub fn attach_watch(&self, id: &ClusterId) -> mpsc::Sender<WatchEvent<K>> {
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.client(id).feeds.lock().unwrap_or_else(PoisonError::into_inner).push_back(rx);
        tx
    }

    /// Make every upstream watch call against `id` fail.
    pub fn fail_watch(&self, id: &ClusterId) {
        self.client(id).fail.store(true, Ordering::SeqCst);
    }

    /// Upstream watch requests received by `id`, oldest first.
    pub fn watch_requests(&self, id: &ClusterId) -> Vec<WatchRequest> {
        self.client(id).requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<K: Resource + Send + Sync + 'static> ClusterRegistry<K> for MemoryRegistry<K> {
    fn ready_clusters(&self) -> Result<Vec<ClusterRef>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(msg) = &state.enumeration_error {
            return Err(anyhow!("{msg}"));
        }
        Ok(state.clusters.iter().filter(|c| c.ready).map(|c| ClusterRef::ready(c.id.clone())).collect())
    }

    fn lister_for(&self, cluster: &ClusterId) -> Option<Arc<dyn CachedLister<K>>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let cache = state.clusters.iter().find(|c| &c.id == cluster)?.cache.clone()?;
        Some(cache as Arc<dyn CachedLister<K>>)
    }

    fn client_for(&self, cluster: &ClusterId) -> Option<Arc<dyn WatchClient<K>>> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let client = state.clusters.iter().find(|c| &c.id == cluster)?.client.clone()?;
        Some(client as Arc<dyn WatchClient<K>>)
    }
}
