//! Stateless table conversion for aggregated objects (`kubectl get` style rows).
//!
//! Columns: Namespace (namespaced kinds only), Name, Cluster, kind-specific
//! projected columns for built-ins, Age.

use serde::Serialize;
use smallvec::SmallVec;

use crate::identity::SOURCE_CLUSTER_ANNOTATION;
use crate::ResourceDescriptor;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableColumn {
    pub name: &'static str,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableRow {
    pub cells: Vec<String>,
    /// Full object, only present when requested.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<TableColumn>,
    pub rows: Vec<TableRow>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TableOptions {
    pub include_object: bool,
    /// Reference time (unix seconds) for the Age column; `None` means now.
    pub now: Option<i64>,
}

type Projected = SmallVec<[String; 4]>;

const POD_COLUMNS: [&str; 4] = ["Ready", "Status", "Restarts", "Node"];
const SVC_COLUMNS: [&str; 4] = ["Type", "Cluster-IP", "External-IP", "Ports"];

fn extra_columns(d: &ResourceDescriptor) -> &'static [&'static str] {
    match (d.group.as_str(), d.kind.as_str()) {
        ("", "Pod") => &POD_COLUMNS,
        ("", "Service") => &SVC_COLUMNS,
        _ => &[],
    }
}

fn str_at<'a>(raw: &'a serde_json::Value, ptr: &str) -> Option<&'a str> {
    raw.pointer(ptr).and_then(|v| v.as_str())
}

fn project_pod(raw: &serde_json::Value) -> Projected {
    let (mut ready, mut total, mut restarts) = (0u32, 0u32, 0u64);
    if let Some(cs) = raw.pointer("/status/containerStatuses").and_then(|v| v.as_array()) {
        total = cs.len() as u32;
        for c in cs {
            if c.get("ready").and_then(|v| v.as_bool()).unwrap_or(false) { ready += 1; }
            restarts += c.get("restartCount").and_then(|v| v.as_u64()).unwrap_or(0);
        }
    }
    let status = str_at(raw, "/status/reason")
        .filter(|r| !r.is_empty())
        .or_else(|| str_at(raw, "/status/phase"))
        .unwrap_or("-");
    let node = str_at(raw, "/spec/nodeName").unwrap_or("<none>");
    SmallVec::from_iter([format!("{ready}/{total}"), status.to_string(), restarts.to_string(), node.to_string()])
}

fn project_service(raw: &serde_json::Value) -> Projected {
    let kind = str_at(raw, "/spec/type").unwrap_or("ClusterIP");
    let cluster_ip = str_at(raw, "/spec/clusterIP").unwrap_or("<none>");
    let mut external: Vec<&str> = raw
        .pointer("/spec/externalIPs")
        .and_then(|v| v.as_array())
        .map(|a| a.iter().filter_map(|v| v.as_str()).collect())
        .unwrap_or_default();
    if external.is_empty() {
        if let Some(arr) = raw.pointer("/status/loadBalancer/ingress").and_then(|v| v.as_array()) {
            external.extend(arr.iter().filter_map(|it| {
                it.get("ip").and_then(|v| v.as_str()).or_else(|| it.get("hostname").and_then(|v| v.as_str()))
            }));
        }
    }
    let external = if external.is_empty() { "<none>".to_string() } else { external.join(",") };
    let ports: Vec<String> = raw
        .pointer("/spec/ports")
        .and_then(|v| v.as_array())
        .map(|ports| {
            ports
                .iter()
                .map(|p| {
                    let port = p.get("port").and_then(|v| v.as_u64()).unwrap_or(0);
                    let proto = p.get("protocol").and_then(|v| v.as_str()).unwrap_or("TCP");
                    format!("{port}/{proto}")
                })
                .collect()
        })
        .unwrap_or_default();
    let ports = if ports.is_empty() { "<none>".to_string() } else { ports.join(",") };
    SmallVec::from_iter([kind.to_string(), cluster_ip.to_string(), external, ports])
}

pub fn render_age(creation_ts: i64, now: i64) -> String {
    if creation_ts <= 0 { return "<unknown>".to_string(); }
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

/// Convert objects of one resource type into a table.
pub fn convert_to_table<K: Serialize>(
    descriptor: &ResourceDescriptor,
    objects: &[K],
    opts: TableOptions,
) -> Result<Table, serde_json::Error> {
    let extra = extra_columns(descriptor);
    let mut columns = Vec::with_capacity(4 + extra.len());
    if descriptor.namespaced {
        columns.push(TableColumn { name: "Namespace", kind: "string" });
    }
    columns.push(TableColumn { name: "Name", kind: "string" });
    columns.push(TableColumn { name: "Cluster", kind: "string" });
    columns.extend(extra.iter().map(|name| TableColumn { name: *name, kind: "string" }));
    columns.push(TableColumn { name: "Age", kind: "string" });

    let now = opts.now.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let mut rows = Vec::with_capacity(objects.len());
    for obj in objects {
        let raw = serde_json::to_value(obj)?;
        let mut cells = Vec::with_capacity(columns.len());
        if descriptor.namespaced {
            cells.push(str_at(&raw, "/metadata/namespace").unwrap_or("").to_string());
        }
        cells.push(str_at(&raw, "/metadata/name").unwrap_or("").to_string());
        let cluster = raw
            .pointer("/metadata/annotations")
            .and_then(|a| a.get(SOURCE_CLUSTER_ANNOTATION))
            .and_then(|v| v.as_str())
            .unwrap_or("-");
        cells.push(cluster.to_string());
        match (descriptor.group.as_str(), descriptor.kind.as_str()) {
            ("", "Pod") => cells.extend(project_pod(&raw)),
            ("", "Service") => cells.extend(project_service(&raw)),
            _ => {}
        }
        let created = str_at(&raw, "/metadata/creationTimestamp")
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.timestamp())
            .unwrap_or(0);
        cells.push(render_age(created, now));
        rows.push(TableRow { cells, object: opts.include_object.then_some(raw) });
    }
    Ok(Table { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::unique_copy;
    use crate::ClusterId;
    use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    #[test]
    fn service_rows_carry_cluster_and_ports() {
        let svc = Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("x".into()),
                creation_timestamp: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z").unwrap().with_timezone(&chrono::Utc),
                )),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".into()),
                cluster_ip: Some("10.0.0.1".into()),
                ports: Some(vec![ServicePort { port: 80, protocol: Some("TCP".into()), ..Default::default() }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let svc = unique_copy(&svc, &ClusterId::new("east").unwrap());
        let d = ResourceDescriptor::of::<Service>(true);
        let now = chrono::DateTime::parse_from_rfc3339("2024-01-02T03:00:00Z").unwrap().timestamp();
        let table = convert_to_table(&d, &[svc], TableOptions { include_object: false, now: Some(now) }).unwrap();
        let names: Vec<_> = table.columns.iter().map(|c| c.name).collect();
        assert_eq!(names, ["Namespace", "Name", "Cluster", "Type", "Cluster-IP", "External-IP", "Ports", "Age"]);
        assert_eq!(table.rows[0].cells, ["x", "east:web", "east", "ClusterIP", "10.0.0.1", "<none>", "80/TCP", "1d3h"]);
        assert!(table.rows[0].object.is_none());
    }

    #[test]
    fn age_rendering() {
        assert_eq!(render_age(0, 100), "<unknown>");
        assert_eq!(render_age(100, 145), "45s");
        assert_eq!(render_age(100, 100 + 3 * 60 + 1), "3m");
        assert_eq!(render_age(100, 100 + 2 * 3600 + 5 * 60), "2h5m");
    }
}
