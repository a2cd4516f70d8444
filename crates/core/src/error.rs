use thiserror::Error;

pub type AggregateResult<T> = Result<T, AggregateError>;

/// Errors surfaced by the aggregation read path.
///
/// Per-cluster degradation (unsynced cache, missing lister, list failure) is never
/// represented here: those clusters are skipped and only show up in logs and metrics.
#[derive(Debug, Error)]
pub enum AggregateError {
    /// The registry could not enumerate ready clusters; nothing meaningful can be returned.
    #[error("listing ready clusters: {0}")]
    Registry(String),

    #[error("{resource} \"{name}\" not found")]
    NotFound { resource: String, name: String },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("invalid cluster id {0:?}: must be a DNS-1123 subdomain")]
    InvalidClusterId(String),
}

impl AggregateError {
    pub fn not_found(resource: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound { resource: resource.into(), name: name.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self { Self::BadRequest(msg.into()) }

    pub fn registry(err: impl std::fmt::Display) -> Self { Self::Registry(format!("{err:#}")) }

    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound { .. }) }

    pub fn is_bad_request(&self) -> bool { matches!(self, Self::BadRequest(_)) }
}
