//! Meridian aggregated resource API.
//!
//! Adapts the aggregated lister and the watch fan-in engine to the standard
//! get/list/watch resource-server contract consumed by API servers and clients.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use kube::Resource;
use meridian_core::table::{self, Table, TableOptions};
use meridian_core::{AggregateError, FieldSelector, LabelSelector, ResourceDescriptor};
use meridian_kubehub::{ClusterRegistry, FanIn, FanInConfig, ProxyWatch, WatchRequest};
use meridian_store::AggregatedLister;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

pub use meridian_core::table::{TableColumn, TableRow};

/// API errors suitable for transport to clients.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ApiError {
    #[error("bad_request: {0}")]
    BadRequest(String),
    #[error("not_found: {resource} \"{name}\"")]
    NotFound { resource: String, name: String },
    #[error("method_not_supported: {verb} is not supported on {resource}")]
    MethodNotSupported { resource: String, verb: String },
    #[error("internal: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn is_not_found(&self) -> bool { matches!(self, ApiError::NotFound { .. }) }

    /// HTTP status code conventionally used for this error.
    pub fn code(&self) -> u16 {
        match self {
            ApiError::BadRequest(_) => 400,
            ApiError::NotFound { .. } => 404,
            ApiError::MethodNotSupported { .. } => 405,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<AggregateError> for ApiError {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::NotFound { resource, name } => ApiError::NotFound { resource, name },
            AggregateError::BadRequest(msg) => ApiError::BadRequest(msg),
            AggregateError::InvalidClusterId(_) => ApiError::BadRequest(e.to_string()),
            AggregateError::Registry(_) => ApiError::Internal(e.to_string()),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Per-request context resolved by the serving layer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    /// External namespace; `None` addresses all namespaces.
    pub namespace: Option<String>,
}

impl RequestContext {
    pub fn namespaced(ns: impl Into<String>) -> Self { Self { namespace: Some(ns.into()) } }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOptions {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListOptions {
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// Watch only: server-side timeout of each upstream watch.
    pub timeout_seconds: Option<u64>,
}

impl ListOptions {
    fn selectors(&self) -> ApiResult<(LabelSelector, FieldSelector)> {
        let labels = match self.label_selector.as_deref() {
            Some(s) => s.parse()?,
            None => LabelSelector::everything(),
        };
        let fields = match self.field_selector.as_deref() {
            Some(s) => s.parse()?,
            None => FieldSelector::everything(),
        };
        Ok((labels, fields))
    }
}

/// List wrapper for one resource type (`ServiceList`, `PodList`, ...).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceList<K> {
    pub kind: String,
    pub items: Vec<K>,
}

/// Request verbs of the resource-server contract.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verb {
    Get,
    List,
    Watch,
    Other(String),
}

impl FromStr for Verb {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "get" => Verb::Get,
            "list" => Verb::List,
            "watch" => Verb::Watch,
            other => Verb::Other(other.to_string()),
        })
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verb::Get => f.write_str("get"),
            Verb::List => f.write_str("list"),
            Verb::Watch => f.write_str("watch"),
            Verb::Other(v) => f.write_str(v),
        }
    }
}

/// Entry point selected for a verb. List and watch share one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Get,
    ListWatch { min_request_timeout: Duration },
}

/// Get/list/watch contract for resource kind `K`.
#[async_trait::async_trait]
pub trait ResourceServer<K>: Send + Sync {
    fn descriptor(&self) -> &ResourceDescriptor;

    fn new_list(&self) -> ResourceList<K>;

    async fn get(&self, ctx: &RequestContext, name: &str, opts: &GetOptions) -> ApiResult<K>;

    async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> ApiResult<ResourceList<K>>;

    async fn watch(&self, ctx: &RequestContext, opts: &ListOptions) -> ApiResult<ProxyWatch<K>>;

    fn convert_to_table(&self, objects: &[K], opts: TableOptions) -> ApiResult<Table>;
}

/// Aggregated resource served from every ready member cluster.
pub struct AggregatedResource<K> {
    lister: AggregatedLister<K>,
    fanin: FanInConfig,
    min_request_timeout: Duration,
}

impl<K> AggregatedResource<K>
where
    K: Resource + Clone + Send + Sync + 'static,
{
    pub fn new(registry: Arc<dyn ClusterRegistry<K>>, descriptor: ResourceDescriptor, min_request_timeout: Duration) -> Self {
        Self { lister: AggregatedLister::new(registry, descriptor), fanin: FanInConfig::default(), min_request_timeout }
    }

    pub fn with_fanin_config(mut self, cfg: FanInConfig) -> Self {
        self.fanin = cfg;
        self
    }

    pub fn lister(&self) -> &AggregatedLister<K> { &self.lister }

    /// Resolve the handler for `verb`; anything but get/list/watch is rejected.
    pub fn handler(&self, verb: &Verb) -> ApiResult<Handler> {
        match verb {
            Verb::Get => Ok(Handler::Get),
            Verb::List | Verb::Watch => Ok(Handler::ListWatch { min_request_timeout: self.min_request_timeout }),
            Verb::Other(v) => Err(ApiError::MethodNotSupported {
                resource: self.lister.descriptor().group_resource(),
                verb: v.clone(),
            }),
        }
    }

    fn scope<'a>(&self, ctx: &'a RequestContext) -> Option<&'a str> {
        if self.lister.descriptor().namespaced { ctx.namespace.as_deref() } else { None }
    }

    /// Caller's timeout, else `None` so the fan-in `watch_timeout` applies.
    fn upstream_timeout(opts: &ListOptions) -> Option<Duration> {
        opts.timeout_seconds.filter(|secs| *secs > 0).map(Duration::from_secs)
    }
}

#[async_trait::async_trait]
impl<K> ResourceServer<K> for AggregatedResource<K>
where
    K: Resource + Clone + Serialize + Send + Sync + 'static,
{
    fn descriptor(&self) -> &ResourceDescriptor { self.lister.descriptor() }

    fn new_list(&self) -> ResourceList<K> {
        ResourceList { kind: format!("{}List", self.lister.descriptor().kind), items: Vec::new() }
    }

    async fn get(&self, ctx: &RequestContext, name: &str, _opts: &GetOptions) -> ApiResult<K> {
        let res = match self.scope(ctx) {
            Some(ns) => self.lister.by_namespace(ns).get(name),
            None => self.lister.get(name),
        };
        res.map_err(|e| match e {
            AggregateError::NotFound { .. } | AggregateError::BadRequest(_) => ApiError::from(e),
            other => {
                let resource = self.lister.descriptor().group_resource();
                error!(error = %other, resource = %resource, namespace = ?ctx.namespace, name, "aggregated get failed");
                ApiError::Internal(format!("failed getting {resource}: {other}"))
            }
        })
    }

    async fn list(&self, ctx: &RequestContext, opts: &ListOptions) -> ApiResult<ResourceList<K>> {
        let (labels, fields) = opts.selectors()?;
        let res = match self.scope(ctx) {
            Some(ns) => self.lister.by_namespace(ns).list(&labels),
            None => self.lister.list(&labels),
        };
        let objs = res.map_err(|e| {
            let resource = self.lister.descriptor().group_resource();
            error!(error = %e, resource = %resource, labels = %labels, namespace = ?ctx.namespace, "aggregated list failed");
            ApiError::Internal(format!("failed listing {resource}: {e}"))
        })?;
        let mut list = self.new_list();
        list.items = objs.into_iter().filter(|o| fields.matches_object(o)).collect();
        debug!(resource = %self.lister.descriptor().group_resource(), items = list.items.len(), "list served");
        Ok(list)
    }

    async fn watch(&self, ctx: &RequestContext, opts: &ListOptions) -> ApiResult<ProxyWatch<K>> {
        let (labels, fields) = opts.selectors()?;
        let request = WatchRequest {
            namespace: self.scope(ctx).map(str::to_string),
            labels,
            fields,
            timeout: Self::upstream_timeout(opts),
        };
        let watch = FanIn::start(Arc::clone(self.lister.registry()), request, &self.fanin).await?;
        Ok(watch)
    }

    fn convert_to_table(&self, objects: &[K], opts: TableOptions) -> ApiResult<Table> {
        table::convert_to_table(self.lister.descriptor(), objects, opts).map_err(|e| ApiError::Internal(e.to_string()))
    }
}
