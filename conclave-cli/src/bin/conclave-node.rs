//! Reference node entry point
//!
//! Hosts a node's control socket, prints `READY` once it listens, and runs until
//! told to shut down. Stdout carries only the readiness handshake; logs go to
//! stderr or the configured log file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use conclave_core::config::NodeConfig;
use conclave_core::control::{ControlServer, NodeHandler, SocketDir};
use conclave_core::events::{DEFAULT_HISTORY_SIZE, EventStream, EventType};
use conclave_core::metrics::{MetricsCollector, NodeMetrics};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "conclave-node")]
#[command(about = "Conclave reference node", long_about = None)]
#[command(version)]
struct Args {
    /// Node configuration as JSON
    #[arg(long)]
    config: String,

    /// Comma-separated names of every node in the fleet
    #[arg(long, default_value = "")]
    available_nodes: String,

    /// Directory holding control sockets
    #[arg(long)]
    socket_dir: PathBuf,
}

/// In-memory peer table
struct PeerTable {
    known: BTreeSet<String>,
    peers: RwLock<BTreeMap<String, String>>,
    metrics: NodeMetrics,
}

impl PeerTable {
    fn new(available_nodes: &str, metrics: NodeMetrics) -> Self {
        Self {
            known: available_nodes
                .split(',')
                .map(str::trim)
                .filter(|name| !name.is_empty())
                .map(str::to_string)
                .collect(),
            peers: RwLock::new(BTreeMap::new()),
            metrics,
        }
    }
}

#[async_trait]
impl NodeHandler for PeerTable {
    async fn connect_peer(&self, target: &str, endpoint: &str) -> bool {
        if !self.known.is_empty() && !self.known.contains(target) {
            warn!("Refusing unknown peer {}", target);
            return false;
        }

        let active = {
            let mut peers = self.peers.write().await;
            peers.insert(target.to_string(), endpoint.to_string());
            peers.len()
        };
        info!("Added peer {} at {}", target, endpoint);

        if let Err(e) = self.metrics.set_active_connections(active).await {
            warn!("Failed to record active connections: {}", e);
        }
        true
    }
}

fn init_logging(config: &NodeConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config: NodeConfig =
        serde_json::from_str(&args.config).context("Invalid --config JSON")?;
    config.validate()?;
    init_logging(&config)?;

    let collector = Arc::new(MetricsCollector::new());
    let metrics = NodeMetrics::new(config.name.clone(), collector).await?;
    let events = Arc::new(EventStream::new(config.name.clone(), DEFAULT_HISTORY_SIZE));
    let peers = Arc::new(PeerTable::new(&args.available_nodes, metrics.clone()));

    let server = ControlServer::bind(
        config.name.clone(),
        &SocketDir::new(&args.socket_dir),
        peers,
        metrics.clone(),
        events.clone(),
    )
    .await?;
    let shutdown = server.shutdown_token();

    metrics.mark_started().await?;
    events
        .emit(
            EventType::NodeStarted,
            json!({ "port": config.port, "pid": std::process::id() }),
        )
        .await;

    let serving = tokio::spawn(server.serve());

    {
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "READY")?;
        stdout.flush()?;
    }
    info!("Node {} ready (port: {})", config.name, config.port);

    tokio::select! {
        _ = shutdown.cancelled() => {}
        signal = termination() => {
            let signal = signal?;
            info!("Node {} received {}", config.name, signal);
        }
    }

    events
        .emit(EventType::NodeStopped, json!({ "port": config.port }))
        .await;
    metrics.mark_stopped().await?;
    shutdown.cancel();
    serving.await??;

    info!("Node {} stopped", config.name);
    Ok(())
}

#[cfg(unix)]
async fn termination() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = term.recv() => Ok("SIGTERM"),
        _ = interrupt.recv() => Ok("SIGINT"),
    }
}

#[cfg(not(unix))]
async fn termination() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("Ctrl-C")
}
