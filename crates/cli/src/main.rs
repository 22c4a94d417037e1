use std::str::FromStr;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use kinformer_apply::{ManifestLimits, UpdateStrategy};
use kinformer_core::addressing::ResourceMeta;
use kinformer_core::time::{elapsed_time, now_rfc3339, seconds_diff};
use kinformer_plugins::{Item, Model};
use kinformer_store::{CollectionCache, LiveEvent, StoreConfig};
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kinformerctl", version, about = "Kinformer CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Backend base URL, e.g. a `kubectl proxy` endpoint
    #[arg(long = "api-url", global = true, env = "KINFORMER_API_URL")]
    api_url: Option<String>,

    /// Watch over WebSocket against this base URL
    #[arg(long = "watch-ws-url", global = true, env = "KINFORMER_WATCH_WS_URL")]
    watch_ws_url: Option<String>,

    /// Namespace for listing, and the default for namespaced manifests
    #[arg(short = 'n', long = "namespace", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List a collection, e.g. `ls deployments --base /apis/apps/v1`
    Ls {
        resource: String,
        /// API root of the resource
        #[arg(long = "base", default_value = "/api/v1")]
        base: String,
    },
    /// Stream +/~/- events for a collection until Ctrl-C
    Watch {
        resource: String,
        #[arg(long = "base", default_value = "/api/v1")]
        base: String,
    },
    /// Create or update every object in a manifest
    Apply {
        #[arg(short = 'f', long = "filename")]
        file: String,
        /// apply | merge | replace | json-patch=/a,/b
        #[arg(long = "strategy", default_value = "apply")]
        strategy: String,
    },
    /// Delete every object in a manifest
    Delete {
        #[arg(short = 'f', long = "filename")]
        file: String,
        /// Reflect the deletion locally without waiting for the watch
        #[arg(long = "sync", action = ArgAction::SetTrue)]
        sync: bool,
    },
}

fn init_tracing() {
    let env = std::env::var("KINFORMER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter =
        tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KINFORMER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KINFORMER_METRICS_ADDR; expected host:port");
        }
    }
}

fn store_config(cli: &Cli) -> StoreConfig {
    let mut cfg = StoreConfig::from_env();
    if let Some(url) = &cli.api_url {
        cfg.api_url = url.clone();
    }
    if let Some(url) = &cli.watch_ws_url {
        cfg.watch_ws_api_url = Some(url.clone());
    }
    if let Some(ns) = &cli.namespace {
        cfg.default_namespace = ns.clone();
    }
    cfg
}

fn age(item: &Item) -> String {
    item.raw()
        .metadata
        .extra
        .get("creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|ts| seconds_diff(ts, &now_rfc3339()))
        .and_then(elapsed_time)
        .map(|e| e.label)
        .unwrap_or_else(|| "-".to_string())
}

/// Kind-specific status column.
fn detail(item: &Item) -> String {
    match item.model() {
        Some(Model::Pod(p)) => format!("ready {} restarts {}", p.ready_display(), p.restart_count()),
        Some(Model::Workload(w)) => {
            format!("replicas {} restarts {}", w.replicas().map(|r| r.to_string()).unwrap_or_default(), w.restarts)
        }
        Some(Model::Job(j)) => format!("completions {} {}", j.completions_display(), j.duration_display()),
        Some(Model::CronJob(c)) if c.is_suspended() => "suspended".to_string(),
        Some(Model::PodMetrics(m)) => format!("cpu {} memory {}", m.usage.cpu.si, m.usage.memory.si),
        _ => String::new(),
    }
}

fn in_namespace(item: &Item, ns: Option<&str>) -> bool {
    ns.map(|n| item.raw().namespace() == Some(n)).unwrap_or(true)
}

fn manifest(file: &str, limits: &ManifestLimits) -> Result<Vec<kinformer_core::Unstructured>> {
    let text = std::fs::read_to_string(file).with_context(|| format!("reading {file}"))?;
    limits.parse(&text).with_context(|| format!("parsing {file}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cache = CollectionCache::new(store_config(&cli)).context("building collection cache")?;
    let ns = cli.namespace.as_deref();

    match &cli.command {
        Commands::Ls { resource, base } => {
            info!(resource = %resource, base = %base, ns = ?ns, "ls invoked");
            let collection = cache.get(resource, Some(&ResourceMeta::base(base))).await?;
            let items: Vec<&Item> = collection.items.iter().filter(|i| in_namespace(i, ns)).collect();
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<40} {:<8} DETAIL", "NAMESPACE", "NAME", "AGE");
                    for item in items {
                        let raw = item.raw();
                        println!(
                            "{:<16} {:<40} {:<8} {}",
                            raw.namespace().unwrap_or("-"),
                            raw.name(),
                            age(item),
                            detail(item)
                        );
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { resource, base } => {
            info!(resource = %resource, base = %base, ns = ?ns, "watch invoked");
            let (tx, mut rx) = mpsc::unbounded_channel();
            let sub = cache.subscribe(resource, move |ev| {
                let _ = tx.send(ev.clone());
            });
            let initial = cache.get(resource, Some(&ResourceMeta::base(base))).await?;
            for item in initial.items.iter().filter(|i| in_namespace(i, ns)) {
                println!("  {}", item.raw().identity());
            }
            loop {
                tokio::select! {
                    maybe = rx.recv() => match maybe {
                        Some(ev) if in_namespace(&ev.item, ns) => {
                            let mark = match ev.live() {
                                Some(LiveEvent::Created) => '+',
                                Some(LiveEvent::Updated) => '~',
                                Some(LiveEvent::Deleted) => '-',
                                None => continue,
                            };
                            match cli.output {
                                Output::Human => println!("{} {}", mark, ev.item.raw().identity()),
                                Output::Json => println!("{}", serde_json::json!({ "type": ev.event_type, "object": ev.item })),
                            }
                        }
                        Some(_) => {}
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            sub.unsubscribe();
        }
        Commands::Apply { file, strategy } => {
            let strategy = UpdateStrategy::from_str(strategy).map_err(anyhow::Error::msg)?;
            let docs = manifest(file, &cache.config().manifest_limits)?;
            info!(file = %file, objects = docs.len(), strategy = %strategy, "apply invoked");
            let applied = cache.mutation_client().apply_or_replace(docs, &strategy).await?;
            for item in applied {
                println!("{} {} applied", item.raw().kind, item.raw().identity());
            }
        }
        Commands::Delete { file, sync } => {
            let docs = manifest(file, &cache.config().manifest_limits)?;
            info!(file = %file, objects = docs.len(), sync, "delete invoked");
            let labels: Vec<String> = docs.iter().map(|d| format!("{} {}", d.kind, d.identity())).collect();
            cache.mutation_client().delete(docs, *sync).await?;
            for l in labels {
                println!("{l} deleted");
            }
        }
    }

    cache.destroy();
    Ok(())
}
