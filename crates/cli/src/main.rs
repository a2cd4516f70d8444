use std::fmt::Debug;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::Resource;
use meridian_api::{
    AggregatedResource, GetOptions, ListOptions, RequestContext, ResourceList, ResourceServer, Verb,
};
use meridian_core::table::{Table, TableOptions};
use meridian_core::{ResourceDescriptor, WatchEvent};
use meridian_kubehub::{ClusterRegistry, FanInConfig, KubeRegistry};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "meridianctl", version, about = "Meridian multi-cluster aggregation CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Namespace scope (default: all namespaces)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    /// Member kubeconfig contexts, `context` or `alias=context` (default: all contexts)
    #[arg(long = "contexts", env = "MERIDIAN_CONTEXTS", value_delimiter = ',', global = true)]
    contexts: Vec<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json, Yaml }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Kind {
    #[value(alias = "svc")]
    Services,
    #[value(alias = "po")]
    Pods,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe member clusters and print their readiness
    Clusters,
    /// Aggregated list across ready clusters
    Ls {
        kind: Kind,
        /// Label selector, e.g. "app=web,tier!=db"
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
    /// Aggregated get by unique name ("<cluster>:<name>" or "<ns>/<cluster>:<name>")
    Get { kind: Kind, name: String },
    /// Fan-in watch across ready clusters
    Watch {
        kind: Kind,
        #[arg(short = 'l', long = "selector")]
        selector: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("MERIDIAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("MERIDIAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid MERIDIAN_METRICS_ADDR; expected host:port");
        }
    }
}

fn env_secs(key: &str, default: u64) -> Duration {
    Duration::from_secs(std::env::var(key).ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(default))
}

fn print_table(table: &Table) {
    let mut widths: Vec<usize> = table.columns.iter().map(|c| c.name.len()).collect();
    for row in &table.rows {
        for (w, cell) in widths.iter_mut().zip(&row.cells) {
            *w = (*w).max(cell.len());
        }
    }
    let header: Vec<String> =
        table.columns.iter().zip(&widths).map(|(c, w)| format!("{:<w$}", c.name.to_uppercase(), w = *w)).collect();
    println!("{}", header.join("  ").trim_end());
    for row in &table.rows {
        let line: Vec<String> = row.cells.iter().zip(&widths).map(|(c, w)| format!("{:<w$}", c, w = *w)).collect();
        println!("{}", line.join("  ").trim_end());
    }
}

fn print_value<T: Serialize>(output: Output, value: &T) -> Result<()> {
    match output {
        Output::Json | Output::Human => println!("{}", serde_json::to_string_pretty(value)?),
        Output::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn context_of(cli: &Cli) -> RequestContext {
    cli.namespace.clone().map(RequestContext::namespaced).unwrap_or_default()
}

async fn resource_for<K>(registry: &Arc<KubeRegistry>, wait_for_sync: bool) -> AggregatedResource<K>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let informers = registry.informers::<K>();
    if wait_for_sync {
        let wait = env_secs("MERIDIAN_WAIT_SECS", 8);
        if !informers.wait_synced(wait).await {
            warn!(wait_secs = wait.as_secs(), "some caches not synced; results may be partial");
        }
    }
    AggregatedResource::new(
        informers as Arc<dyn ClusterRegistry<K>>,
        ResourceDescriptor::of::<K>(true),
        env_secs("MERIDIAN_MIN_REQUEST_TIMEOUT_SECS", 1800),
    )
    .with_fanin_config(FanInConfig::from_env())
}

async fn ls<K>(cli: &Cli, registry: &Arc<KubeRegistry>, selector: Option<String>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let res = resource_for::<K>(registry, true).await;
    res.handler(&Verb::List)?;
    let t0 = Instant::now();
    let opts = ListOptions { label_selector: selector, ..Default::default() };
    let list: ResourceList<K> = res.list(&context_of(cli), &opts).await?;
    info!(items = list.items.len(), took_ms = %t0.elapsed().as_millis(), "ls complete");
    match cli.output {
        Output::Human => print_table(&res.convert_to_table(&list.items, TableOptions::default())?),
        out => print_value(out, &list)?,
    }
    Ok(())
}

async fn get<K>(cli: &Cli, registry: &Arc<KubeRegistry>, name: &str) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let res = resource_for::<K>(registry, true).await;
    res.handler(&Verb::Get)?;
    let obj = res.get(&context_of(cli), name, &GetOptions::default()).await?;
    match cli.output {
        Output::Human => print_table(&res.convert_to_table(std::slice::from_ref(&obj), TableOptions::default())?),
        out => print_value(out, &obj)?,
    }
    Ok(())
}

async fn watch<K>(cli: &Cli, registry: &Arc<KubeRegistry>, selector: Option<String>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let res = resource_for::<K>(registry, false).await;
    res.handler(&Verb::Watch)?;
    let opts = ListOptions { label_selector: selector, ..Default::default() };
    let mut w = res.watch(&context_of(cli), &opts).await?;
    info!(session = %w.session_id(), live = w.live_workers(), "watch started");
    loop {
        tokio::select! {
            maybe = w.next() => {
                let Some(ev) = maybe else {
                    warn!("watch stream ended");
                    break;
                };
                match cli.output {
                    Output::Human => match &ev {
                        WatchEvent::Error(s) => println!("ERROR     {} {}: {}", s.code, s.reason, s.message),
                        other => {
                            let meta = other.object().map(|o| o.meta());
                            let ns = meta.and_then(|m| m.namespace.as_deref()).unwrap_or("");
                            let name = meta.and_then(|m| m.name.as_deref()).unwrap_or("");
                            let key = if ns.is_empty() { name.to_string() } else { format!("{ns}/{name}") };
                            println!("{:<9} {}", other.type_name(), key);
                        }
                    },
                    Output::Json => println!("{}", serde_json::to_string(&ev)?),
                    Output::Yaml => print!("---\n{}", serde_yaml::to_string(&ev)?),
                }
            }
            _ = signal::ctrl_c() => {
                info!("Ctrl-C received; stopping watch");
                break;
            }
        }
    }
    w.shutdown().await;
    let stats = w.stats();
    info!(forwarded = stats.forwarded, dropped = stats.dropped_after_close, "watch ended");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let registry = Arc::new(KubeRegistry::from_kubeconfig(&cli.contexts).await.context("building member registry")?);
    let probe_every = env_secs("MERIDIAN_PROBE_SECS", 30);
    let _probe = (!probe_every.is_zero()).then(|| registry.spawn_probe_loop(probe_every));

    match &cli.command {
        Commands::Clusters => {
            let members = registry.members();
            match cli.output {
                Output::Human => {
                    println!("CLUSTER              READY");
                    for m in &members {
                        println!("{:<20} {}", m.id, m.ready);
                    }
                }
                out => print_value(out, &members)?,
            }
        }
        Commands::Ls { kind, selector } => match kind {
            Kind::Services => ls::<Service>(&cli, &registry, selector.clone()).await?,
            Kind::Pods => ls::<Pod>(&cli, &registry, selector.clone()).await?,
        },
        Commands::Get { kind, name } => match kind {
            Kind::Services => get::<Service>(&cli, &registry, name).await?,
            Kind::Pods => get::<Pod>(&cli, &registry, name).await?,
        },
        Commands::Watch { kind, selector } => match kind {
            Kind::Services => watch::<Service>(&cli, &registry, selector.clone()).await?,
            Kind::Pods => watch::<Pod>(&cli, &registry, selector.clone()).await?,
        },
    }
    Ok(())
}
