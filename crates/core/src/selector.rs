//! Label and field selectors in the Kubernetes string syntax.
//!
//! Label selectors support `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`,
//! `k` and `!k`. Field selectors support `f=v`, `f==v` and `f!=v`; only
//! `metadata.name` and `metadata.namespace` are evaluated locally.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use kube::Resource;
use smallvec::SmallVec;

use crate::identity::UNIQUE_NAME_SEPARATOR;
use crate::{AggregateError, ClusterId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Requirement {
    Equals(String, String),
    NotEquals(String, String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
    Exists(String),
    DoesNotExist(String),
}

impl Requirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            Requirement::Equals(k, v) => labels.get(k) == Some(v),
            Requirement::NotEquals(k, v) => labels.get(k) != Some(v),
            Requirement::In(k, vs) => labels.get(k).is_some_and(|v| vs.contains(v)),
            Requirement::NotIn(k, vs) => labels.get(k).map_or(true, |v| !vs.contains(v)),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::DoesNotExist(k) => !labels.contains_key(k),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Requirement::Equals(k, v) => write!(f, "{k}={v}"),
            Requirement::NotEquals(k, v) => write!(f, "{k}!={v}"),
            Requirement::In(k, vs) => write!(f, "{k} in ({})", vs.join(",")),
            Requirement::NotIn(k, vs) => write!(f, "{k} notin ({})", vs.join(",")),
            Requirement::Exists(k) => f.write_str(k),
            Requirement::DoesNotExist(k) => write!(f, "!{k}"),
        }
    }
}

/// Conjunction of label requirements. The empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    requirements: SmallVec<[Requirement; 4]>,
}

impl LabelSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.requirements.is_empty() }

    pub fn with(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn matches_object<K: Resource>(&self, obj: &K) -> bool {
        if self.is_everything() {
            return true;
        }
        match obj.meta().labels.as_ref() {
            Some(labels) => self.matches(labels),
            None => self.matches(&BTreeMap::new()),
        }
    }
}

/// Split on commas that are not inside a parenthesised value set.
fn split_terms(s: &str) -> Result<Vec<&str>, AggregateError> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth
                    .checked_sub(1)
                    .ok_or_else(|| AggregateError::bad_request(format!("unbalanced ')' in selector {s:?}")))?
            }
            ',' if depth == 0 => {
                out.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(AggregateError::bad_request(format!("unbalanced '(' in selector {s:?}")));
    }
    out.push(s[start..].trim());
    Ok(out)
}

fn valid_key(k: &str) -> bool {
    !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
}

fn valid_value(v: &str) -> bool {
    v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn parse_set(key: &str, rest: &str, term: &str) -> Result<(String, Vec<String>), AggregateError> {
    let inner = rest
        .trim()
        .strip_prefix('(')
        .and_then(|r| r.strip_suffix(')'))
        .ok_or_else(|| AggregateError::bad_request(format!("expected value set in {term:?}")))?;
    let values: Vec<String> = inner.split(',').map(|v| v.trim().to_string()).collect();
    if values.iter().any(|v| v.is_empty() || !valid_value(v)) {
        return Err(AggregateError::bad_request(format!("invalid value set in {term:?}")));
    }
    Ok((key.to_string(), values))
}

fn parse_requirement(term: &str) -> Result<Requirement, AggregateError> {
    let bad = || AggregateError::bad_request(format!("invalid label selector term {term:?}"));
    if let Some(key) = term.strip_prefix('!') {
        let key = key.trim();
        return if valid_key(key) { Ok(Requirement::DoesNotExist(key.to_string())) } else { Err(bad()) };
    }
    let mut words = term.splitn(2, char::is_whitespace);
    let head = words.next().unwrap_or_default();
    let tail = words.next().map(str::trim_start).unwrap_or_default();
    if let Some(rest) = tail.strip_prefix("notin") {
        if !valid_key(head) { return Err(bad()); }
        let (k, vs) = parse_set(head, rest, term)?;
        return Ok(Requirement::NotIn(k, vs));
    }
    if let Some(rest) = tail.strip_prefix("in") {
        if !valid_key(head) { return Err(bad()); }
        let (k, vs) = parse_set(head, rest, term)?;
        return Ok(Requirement::In(k, vs));
    }
    let (key, op, value) = if let Some((k, v)) = term.split_once("!=") {
        (k, "!=", v)
    } else if let Some((k, v)) = term.split_once("==") {
        (k, "=", v)
    } else if let Some((k, v)) = term.split_once('=') {
        (k, "=", v)
    } else {
        let key = term.trim();
        return if valid_key(key) { Ok(Requirement::Exists(key.to_string())) } else { Err(bad()) };
    };
    let (key, value) = (key.trim(), value.trim());
    if !valid_key(key) || !valid_value(value) {
        return Err(bad());
    }
    Ok(match op {
        "!=" => Requirement::NotEquals(key.to_string(), value.to_string()),
        _ => Requirement::Equals(key.to_string(), value.to_string()),
    })
}

impl FromStr for LabelSelector {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            return Ok(Self::everything());
        }
        let mut requirements = SmallVec::new();
        for term in split_terms(s)? {
            if term.is_empty() {
                return Err(AggregateError::bad_request(format!("empty term in label selector {s:?}")));
            }
            requirements.push(parse_requirement(term)?);
        }
        Ok(Self { requirements })
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, r) in self.requirements.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            write!(f, "{r}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldTerm {
    field: String,
    value: String,
    negated: bool,
}

/// Field selector. Carried verbatim to upstream watches; evaluated locally only
/// for `metadata.name` and `metadata.namespace`, other fields always match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSelector {
    terms: Vec<FieldTerm>,
}

impl FieldSelector {
    pub fn everything() -> Self { Self::default() }

    pub fn is_everything(&self) -> bool { self.terms.is_empty() }

    pub fn matches_object<K: Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        self.terms.iter().all(|t| {
            let actual = match t.field.as_str() {
                "metadata.name" => meta.name.as_deref().unwrap_or_default(),
                "metadata.namespace" => meta.namespace.as_deref().unwrap_or_default(),
                _ => return true,
            };
            (actual == t.value) != t.negated
        })
    }

    /// Form of this selector to send to one member cluster.
    ///
    /// Locally `metadata.name` is matched against unique names, upstream against
    /// native names, so those terms are rewritten for `cluster`. Returns `None`
    /// when no object of `cluster` can match.
    pub fn for_cluster(&self, cluster: &ClusterId) -> Option<FieldSelector> {
        let mut terms = Vec::with_capacity(self.terms.len());
        for t in &self.terms {
            if t.field != "metadata.name" {
                terms.push(t.clone());
                continue;
            }
            let native = t
                .value
                .strip_prefix(cluster.as_str())
                .and_then(|rest| rest.strip_prefix(UNIQUE_NAME_SEPARATOR))
                .filter(|n| !n.is_empty());
            match (native, t.negated) {
                (Some(native), negated) => {
                    terms.push(FieldTerm { field: t.field.clone(), value: native.to_string(), negated })
                }
                (None, false) => return None,
                // a foreign unique name never equals one of ours
                (None, true) => {}
            }
        }
        Some(Self { terms })
    }
}

impl FromStr for FieldSelector {
    type Err = AggregateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut terms = Vec::new();
        if s.trim().is_empty() {
            return Ok(Self { terms });
        }
        for term in s.split(',') {
            let (field, value, negated) = if let Some((f, v)) = term.split_once("!=") {
                (f, v, true)
            } else if let Some((f, v)) = term.split_once("==") {
                (f, v, false)
            } else if let Some((f, v)) = term.split_once('=') {
                (f, v, false)
            } else {
                return Err(AggregateError::bad_request(format!("invalid field selector term {term:?}")));
            };
            let field = field.trim();
            if field.is_empty() {
                return Err(AggregateError::bad_request(format!("invalid field selector term {term:?}")));
            }
            terms.push(FieldTerm { field: field.to_string(), value: value.trim().to_string(), negated });
        }
        Ok(Self { terms })
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, t) in self.terms.iter().enumerate() {
            if i > 0 { f.write_str(",")?; }
            let op = if t.negated { "!=" } else { "=" };
            write!(f, "{}{}{}", t.field, op, t.value)?;
        }
        Ok(())
    }
}
