//! Live member clusters: kubeconfig contexts, readiness probing, per-kind
//! reflector caches and upstream watch clients.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use futures::{StreamExt, TryStreamExt};
use kube::{
    api::{Api, WatchEvent as KubeWatchEvent, WatchParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::Request,
    runtime::{
        reflector::{self, Store},
        watcher::{self, Event},
        WatchStreamExt,
    },
    Client, Config, Resource,
};
use meridian_core::{ClusterId, ClusterRef, LabelSelector, WatchEvent, WatchStatus};
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{CachedLister, ClusterRegistry, UpstreamStream, WatchClient, WatchRequest};

/// kube-client rejects server-side watch timeouts of 295s and above.
const MAX_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(290);
const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct Member {
    id: ClusterId,
    client: Client,
    ready: AtomicBool,
}

/// Member clusters reachable through kube clients.
pub struct KubeRegistry {
    members: ArcSwap<Vec<Arc<Member>>>,
    probe_timeout: Duration,
}

impl KubeRegistry {
    /// Build from pre-constructed clients. Members start unready until probed.
    pub fn from_clients(clients: impl IntoIterator<Item = (ClusterId, Client)>) -> Self {
        let members: Vec<Arc<Member>> = clients
            .into_iter()
            .map(|(id, client)| Arc::new(Member { id, client, ready: AtomicBool::new(false) }))
            .collect();
        Self { members: ArcSwap::from_pointee(members), probe_timeout: DEFAULT_PROBE_TIMEOUT }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    /// Build one member per kubeconfig context and probe them once.
    ///
    /// Each entry is either `context` or `alias=context`; the alias (or the context
    /// name) becomes the cluster id. An empty list selects every context.
    pub async fn from_kubeconfig(entries: &[String]) -> Result<Self> {
        let kubeconfig = Kubeconfig::read().context("reading kubeconfig")?;
        let entries: Vec<String> = if entries.is_empty() {
            kubeconfig.contexts.iter().map(|c| c.name.clone()).collect()
        } else {
            entries.to_vec()
        };
        let mut clients = Vec::with_capacity(entries.len());
        for entry in &entries {
            let (alias, context) = entry.split_once('=').unwrap_or((entry.as_str(), entry.as_str()));
            let id = ClusterId::new(alias)
                .with_context(|| format!("context {context:?} needs an alias (alias=context) usable as cluster id"))?;
            let opts = KubeConfigOptions { context: Some(context.to_string()), ..Default::default() };
            let config = Config::from_custom_kubeconfig(kubeconfig.clone(), &opts)
                .await
                .with_context(|| format!("loading kubeconfig context {context:?}"))?;
            let client = Client::try_from(config).with_context(|| format!("building client for {id}"))?;
            debug!(cluster = %id, context = %context, "member client built");
            clients.push((id, client));
        }
        let registry = Self::from_clients(clients);
        registry.probe().await;
        Ok(registry)
    }

    pub fn add_member(&self, id: ClusterId, client: Client) {
        let member = Arc::new(Member { id, client, ready: AtomicBool::new(false) });
        self.members.rcu(|cur| {
            let mut next: Vec<Arc<Member>> = cur.iter().filter(|m| m.id != member.id).cloned().collect();
            next.push(Arc::clone(&member));
            next
        });
    }

    pub fn remove_member(&self, id: &ClusterId) {
        self.members.rcu(|cur| cur.iter().filter(|m| &m.id != id).cloned().collect::<Vec<_>>());
    }

    /// All members with their last known readiness, in registration order.
    pub fn members(&self) -> Vec<ClusterRef> {
        self.members
            .load()
            .iter()
            .map(|m| ClusterRef { id: m.id.clone(), ready: m.ready.load(Ordering::SeqCst) })
            .collect()
    }

    pub fn client(&self, id: &ClusterId) -> Option<Client> {
        self.members.load().iter().find(|m| &m.id == id).map(|m| m.client.clone())
    }

    /// Probe every member's apiserver and update readiness.
    pub async fn probe(&self) -> Vec<ClusterRef> {
        let members = self.members.load_full();
        let probes = members.iter().map(|m| async move {
            let t0 = Instant::now();
            let ok = match tokio::time::timeout(self.probe_timeout, m.client.apiserver_version()).await {
                Ok(Ok(info)) => {
                    debug!(cluster = %m.id, version = %info.git_version, took_ms = %t0.elapsed().as_millis(), "probe ok");
                    true
                }
                Ok(Err(e)) => {
                    warn!(cluster = %m.id, error = %e, "probe failed");
                    false
                }
                Err(_) => {
                    warn!(cluster = %m.id, timeout_ms = %self.probe_timeout.as_millis(), "probe timed out");
                    false
                }
            };
            let was = m.ready.swap(ok, Ordering::SeqCst);
            if was != ok {
                info!(cluster = %m.id, ready = ok, "cluster readiness changed");
            }
        });
        futures::future::join_all(probes).await;
        let refs = self.members();
        metrics::gauge!("meridian_clusters_ready", refs.iter().filter(|c| c.ready).count() as f64);
        refs
    }

    pub fn spawn_probe_loop(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                registry.probe().await;
            }
        })
    }

    fn ready_refs(&self) -> Vec<ClusterRef> {
        self.members().into_iter().filter(|c| c.ready).collect()
    }

    /// Start one reflector per member for kind `K` and return the typed view.
    pub fn informers<K>(self: &Arc<Self>) -> Arc<KindInformers<K>>
    where
        K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    {
        let mut caches = FxHashMap::default();
        let mut tasks = Vec::new();
        for member in self.members.load().iter() {
            let (reader, writer) = reflector::store::<K>();
            let synced = Arc::new(AtomicBool::new(false));
            let api: Api<K> = Api::all(member.client.clone());
            let stream = reflector::reflector(writer, watcher::watcher(api, watcher::Config::default())).default_backoff();
            let flag = Arc::clone(&synced);
            let cluster = member.id.clone();
            tasks.push(tokio::spawn(async move {
                futures::pin_mut!(stream);
                loop {
                    match stream.try_next().await {
                        Ok(Some(Event::Restarted(list))) => {
                            if !flag.swap(true, Ordering::SeqCst) {
                                info!(cluster = %cluster, kind = %K::kind(&()), count = list.len(), "cache synced");
                            }
                        }
                        Ok(Some(_)) => {}
                        Ok(None) => break,
                        Err(e) => warn!(cluster = %cluster, error = %e, "reflector error"),
                    }
                }
                warn!(cluster = %cluster, "reflector stream ended");
            }));
            caches.insert(member.id.clone(), Arc::new(ReflectorLister { store: reader, synced }));
        }
        Arc::new(KindInformers { registry: Arc::clone(self), caches, tasks })
    }
}

/// Reflector-backed cache of kind `K` in one member cluster.
pub struct ReflectorLister<K: Resource<DynamicType = ()> + 'static> {
    store: Store<K>,
    synced: Arc<AtomicBool>,
}

impl<K> CachedLister<K> for ReflectorLister<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    fn has_synced(&self) -> bool { self.synced.load(Ordering::SeqCst) }

    fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<Arc<K>>> {
        Ok(self
            .store
            .state()
            .into_iter()
            .filter(|o| namespace.map_or(true, |ns| o.meta().namespace.as_deref() == Some(ns)))
            .filter(|o| selector.matches_object(o.as_ref()))
            .collect())
    }
}

/// Typed registry view for kind `K` over a [`KubeRegistry`].
pub struct KindInformers<K: Resource<DynamicType = ()> + 'static> {
    registry: Arc<KubeRegistry>,
    caches: FxHashMap<ClusterId, Arc<ReflectorLister<K>>>,
    tasks: Vec<JoinHandle<()>>,
}

impl<K: Resource<DynamicType = ()> + 'static> Drop for KindInformers<K> {
    fn drop(&mut self) {
        for t in &self.tasks {
            t.abort();
        }
    }
}

impl<K> KindInformers<K>
where
    K: Resource<DynamicType = ()> + Clone + Send + Sync + 'static,
{
    /// Wait until every ready member's cache synced or `timeout` elapses.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let pending: Vec<ClusterId> = self
                .registry
                .ready_refs()
                .into_iter()
                .filter(|c| self.caches.get(&c.id).map_or(false, |l| !l.has_synced()))
                .map(|c| c.id)
                .collect();
            if pending.is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                warn!(pending = ?pending, "caches not synced before deadline");
                return false;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }
}

impl<K> ClusterRegistry<K> for KindInformers<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn ready_clusters(&self) -> Result<Vec<ClusterRef>> { Ok(self.registry.ready_refs()) }

    fn lister_for(&self, cluster: &ClusterId) -> Option<Arc<dyn CachedLister<K>>> {
        self.caches.get(cluster).map(|l| Arc::clone(l) as Arc<dyn CachedLister<K>>)
    }

    fn client_for(&self, cluster: &ClusterId) -> Option<Arc<dyn WatchClient<K>>> {
        let client = self.registry.client(cluster)?;
        Some(Arc::new(KubeWatchClient::<K> { client, _kind: std::marker::PhantomData }))
    }
}

/// Opens raw upstream watches (no relist, no retry) for kind `K`.
pub struct KubeWatchClient<K> {
    client: Client,
    _kind: std::marker::PhantomData<fn() -> K>,
}

fn status_from(e: kube::core::ErrorResponse) -> WatchStatus {
    WatchStatus { code: e.code, reason: e.reason, message: e.message }
}

#[async_trait::async_trait]
impl<K> WatchClient<K> for KubeWatchClient<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    async fn watch(&self, req: &WatchRequest) -> Result<UpstreamStream<K>> {
        let mut wp = WatchParams::default();
        if !req.labels.is_everything() {
            wp = wp.labels(&req.labels.to_string());
        }
        if !req.fields.is_everything() {
            wp = wp.fields(&req.fields.to_string());
        }
        if let Some(t) = req.timeout {
            let clamped = t.min(MAX_UPSTREAM_TIMEOUT);
            if clamped < t {
                debug!(requested_secs = t.as_secs(), clamped_secs = clamped.as_secs(), "upstream watch timeout clamped");
            }
            wp = wp.timeout(clamped.as_secs() as u32);
        }
        let url = K::url_path(&(), req.namespace.as_deref());
        let request = Request::new(url).watch(&wp, "0").context("building watch request")?;
        let events = self.client.request_events::<K>(request).await.context("opening upstream watch")?;
        let stream = events
            .filter_map(|res| async move {
                match res {
                    Ok(KubeWatchEvent::Added(o)) => Some(WatchEvent::Added(o)),
                    Ok(KubeWatchEvent::Modified(o)) => Some(WatchEvent::Modified(o)),
                    Ok(KubeWatchEvent::Deleted(o)) => Some(WatchEvent::Deleted(o)),
                    Ok(KubeWatchEvent::Bookmark(_)) => None,
                    Ok(KubeWatchEvent::Error(e)) => Some(WatchEvent::Error(status_from(e))),
                    Err(kube::Error::Api(e)) => Some(WatchEvent::Error(status_from(e))),
                    Err(e) => Some(WatchEvent::Error(WatchStatus {
                        code: 500,
                        reason: "InternalError".to_string(),
                        message: e.to_string(),
                    })),
                }
            })
            .boxed();
        Ok(stream)
    }
}
