use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use floorplan_hass::HassClient;
use floorplan_render::{svg, Applier, MemoryRenderer};
use floorplan_sync::Engine;
use tokio::signal;
use tracing::{info, warn};

mod config;

use config::Config;

#[derive(Parser, Debug)]
#[command(name = "floorplan", version, about = "Mirror Home Assistant entity state onto a floorplan")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// YAML settings file
    #[arg(short = 'c', long = "config", global = true, env = "FLOORPLAN_CONFIG", default_value = "floorplan.yaml")]
    config: PathBuf,

    /// Home Assistant base url (overrides the file)
    #[arg(long = "url", global = true, env = "FLOORPLAN_URL")]
    url: Option<String>,

    /// Long-lived access token (overrides the file)
    #[arg(long = "token", global = true, env = "FLOORPLAN_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sync until Ctrl-C, then print the final element classes
    Run {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(long = "for-secs")]
        for_secs: Option<u64>,
    },
    /// Fetch one state snapshot and print it
    States,
    /// Check that the API is reachable with the configured token
    Check,
}

fn init_tracing() {
    let env = std::env::var("FLOORPLAN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FLOORPLAN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FLOORPLAN_METRICS_ADDR; expected host:port");
        }
    }
}

fn build_client(cfg: &Config) -> Result<HassClient> {
    let client = HassClient::new(&cfg.url, cfg.token.clone())?
        .with_domain_filter(cfg.domain_filter())
        .with_snapshot_timeout(cfg.snapshot_timeout());
    Ok(client)
}

/// Render targets come from the floorplan's element ids; without a floorplan every lookup succeeds.
fn build_renderer(cfg: &Config) -> Result<MemoryRenderer> {
    let Some(path) = cfg.floorplan.as_ref() else {
        warn!("no floorplan configured; rendering onto a permissive in-memory tree");
        return Ok(MemoryRenderer::permissive());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading floorplan {}", path.display()))?;
    let ids = svg::element_ids(&text);
    info!(path = %path.display(), elements = ids.len(), "floorplan loaded");
    Ok(MemoryRenderer::with_elements(ids))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let have_overrides = cli.url.is_some() && cli.token.is_some();
    let cfg = Config::load_or_default(&cli.config, have_overrides)?.with_overrides(cli.url.clone(), cli.token.clone());
    cfg.validate()?;

    match cli.command {
        Commands::Check => {
            let client = build_client(&cfg)?;
            let message = client.check_api().await?;
            match cli.output {
                Output::Human => println!("{}: {}", client.base_url(), message),
                Output::Json => println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                    "url": client.base_url().as_str(),
                    "message": message,
                }))?),
            }
        }
        Commands::States => {
            let client = build_client(&cfg)?;
            let t0 = Instant::now();
            let states = client.snapshot().await?;
            info!(count = states.len(), took_ms = %t0.elapsed().as_millis(), "states fetched");
            match cli.output {
                Output::Human => {
                    println!("{:<48} STATE", "ENTITY");
                    for s in &states {
                        println!("{:<48} {}", s.id(), s.value());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&states)?),
            }
        }
        Commands::Run { for_secs } => {
            let client = build_client(&cfg)?;
            let renderer = Arc::new(build_renderer(&cfg)?);
            let applier = Applier::new(renderer.clone(), Arc::new(cfg.aliases()));
            let engine = Engine::start(Arc::new(client), applier, cfg.sync_config());

            match for_secs {
                Some(secs) => tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(secs)) => info!(secs, "run window elapsed"),
                    _ = signal::ctrl_c() => info!("Ctrl-C received; shutting down"),
                },
                None => {
                    signal::ctrl_c().await.context("waiting for Ctrl-C")?;
                    info!("Ctrl-C received; shutting down");
                }
            }
            let stats = engine.shutdown().await?;

            let elements = renderer.dump();
            match cli.output {
                Output::Human => {
                    println!("{:<48} CLASSES", "ELEMENT");
                    for (sel, classes) in &elements {
                        println!("{:<48} {}", sel, classes.join(" "));
                    }
                    println!("applied={} missing={} failed={}", stats.applied, stats.missing, stats.failed);
                }
                Output::Json => {
                    let items: Vec<_> = elements
                        .iter()
                        .map(|(sel, classes)| serde_json::json!({ "selector": sel, "classes": classes }))
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                        "elements": items,
                        "applied": stats.applied,
                        "missing": stats.missing,
                        "failed": stats.failed,
                    }))?);
                }
            }
        }
    }
    Ok(())
}
