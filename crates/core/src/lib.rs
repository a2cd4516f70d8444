//! Meridian core types: cluster identity, watch events, selectors and errors.

#![forbid(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub mod error;
pub mod identity;
pub mod selector;
pub mod table;

pub use error::{AggregateError, AggregateResult};
pub use selector::{FieldSelector, LabelSelector};

static CLUSTER_ID_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

const CLUSTER_ID_MAX_LEN: usize = 253;

/// Identifier of a member cluster, unique within the registry.
///
/// Always a DNS-1123 subdomain, so it can never contain
/// [`identity::UNIQUE_NAME_SEPARATOR`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    pub fn new(id: impl Into<String>) -> AggregateResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > CLUSTER_ID_MAX_LEN || !CLUSTER_ID_RE.is_match(&id) {
            return Err(AggregateError::InvalidClusterId(id));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl TryFrom<String> for ClusterId {
    type Error = AggregateError;
    fn try_from(v: String) -> Result<Self, Self::Error> { Self::new(v) }
}

impl From<ClusterId> for String {
    fn from(v: ClusterId) -> Self { v.0 }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str { &self.0 }
}

/// Registry snapshot entry for one member cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterRef {
    pub id: ClusterId,
    pub ready: bool,
}

impl ClusterRef {
    pub fn ready(id: ClusterId) -> Self { Self { id, ready: true } }
}

impl AsRef<ClusterId> for ClusterRef {
    fn as_ref(&self) -> &ClusterId { &self.id }
}

impl AsRef<ClusterId> for ClusterId {
    fn as_ref(&self) -> &ClusterId { self }
}

/// Status payload of a watch `Error` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchStatus {
    pub code: u16,
    pub reason: String,
    pub message: String,
}

/// One event of a (possibly aggregated) watch stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WatchEvent<K> {
    Added(K),
    Modified(K),
    Deleted(K),
    Error(WatchStatus),
}

impl<K> WatchEvent<K> {
    /// Apply `f` to the carried object; `Error` passes through untouched.
    pub fn map_object(self, f: impl FnOnce(K) -> K) -> Self {
        match self {
            WatchEvent::Added(o) => WatchEvent::Added(f(o)),
            WatchEvent::Modified(o) => WatchEvent::Modified(f(o)),
            WatchEvent::Deleted(o) => WatchEvent::Deleted(f(o)),
            WatchEvent::Error(s) => WatchEvent::Error(s),
        }
    }

    pub fn object(&self) -> Option<&K> {
        match self {
            WatchEvent::Added(o) | WatchEvent::Modified(o) | WatchEvent::Deleted(o) => Some(o),
            WatchEvent::Error(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            WatchEvent::Added(_) => "ADDED",
            WatchEvent::Modified(_) => "MODIFIED",
            WatchEvent::Deleted(_) => "DELETED",
            WatchEvent::Error(_) => "ERROR",
        }
    }
}

/// Static description of an aggregated resource type, resolved once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub group: String,
    pub resource: String,
    pub kind: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn of<K>(namespaced: bool) -> Self
    where
        K: kube::Resource<DynamicType = ()>,
    {
        Self {
            group: K::group(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            namespaced,
        }
    }

    /// `resource.group`, or bare `resource` for the core group.
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() { self.resource.clone() } else { format!("{}.{}", self.resource, self.group) }
    }
}

pub mod prelude {
    pub use super::{
        AggregateError, AggregateResult, ClusterId, ClusterRef, FieldSelector, LabelSelector, ResourceDescriptor,
        WatchEvent, WatchStatus,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Namespace, Service};

    #[test]
    fn cluster_id_accepts_dns_subdomains() {
        for ok in ["a", "member-1", "eu.west-1", "c0"] {
            assert!(ClusterId::new(ok).is_ok(), "{ok}");
        }
        for bad in ["", "Upper", "has:colon", "-lead", "trail-", "a/b", "a..b"] {
            assert!(ClusterId::new(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn descriptor_from_openapi_types() {
        let svc = ResourceDescriptor::of::<Service>(true);
        assert_eq!(svc.resource, "services");
        assert_eq!(svc.group_resource(), "services");
        assert!(svc.namespaced);
        let ns = ResourceDescriptor::of::<Namespace>(false);
        assert_eq!(ns.kind, "Namespace");
    }

    #[test]
    fn error_events_skip_object_mapping() {
        let ev: WatchEvent<String> = WatchEvent::Error(WatchStatus { code: 410, reason: "Gone".into(), message: "expired".into() });
        let mapped = ev.map_object(|s| format!("x-{s}"));
        assert!(mapped.object().is_none());
        let ev = WatchEvent::Added("a".to_string()).map_object(|s| format!("x-{s}"));
        assert_eq!(ev.object().map(String::as_str), Some("x-a"));
    }
}
