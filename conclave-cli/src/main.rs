//! Conclave CLI - Run node fleets and talk to node control sockets

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand, ValueEnum};
use conclave_core::config::ConclaveConfig;
use conclave_core::control::{ResponseStatus, SocketDir, node_endpoint};
use conclave_core::metrics::MetricsFormat;
use conclave_supervisor::{NodeSupervisor, SocketClient};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "conclave")]
#[command(about = "Conclave node fleet supervisor", long_about = None)]
#[command(version)]
struct Cli {
    /// Directory holding node control sockets
    #[arg(long, global = true, env = "CONCLAVE_SOCKET_DIR")]
    socket_dir: Option<PathBuf>,

    /// Control-socket timeout
    #[arg(long, global = true, default_value_t = 5)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every node of a fleet file and supervise it until Ctrl-C
    Run {
        /// Fleet configuration file (TOML, YAML or JSON)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Check a node's control socket
    Health {
        /// Node name
        node: String,
    },
    /// Fetch a node's metrics
    Metrics {
        /// Node name
        node: String,
        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Json)]
        format: Format,
    },
    /// Ask a node to exit
    Shutdown {
        /// Node name
        node: String,
    },
    /// Stream a node's events until it closes the stream
    Events {
        /// Node name
        node: String,
    },
    /// Tell `from` to add `to` as a peer
    Connect {
        from: String,
        to: String,
        /// Port of `to`
        #[arg(short, long)]
        port: u16,
    },
    /// Version information
    Version,
}

#[derive(Clone, Copy, ValueEnum)]
enum Format {
    Json,
    Prometheus,
}

impl From<Format> for MetricsFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => MetricsFormat::Json,
            Format::Prometheus => MetricsFormat::Prometheus,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let socket_dir = cli.socket_dir.clone();
    let timeout = Duration::from_secs(cli.timeout_secs);
    let client = move || {
        let root = socket_dir.clone().unwrap_or_else(SocketDir::default_root);
        SocketClient::new(Arc::new(SocketDir::new(root)), timeout)
    };

    match cli.command {
        Commands::Version => {
            println!("conclave {}", env!("CARGO_PKG_VERSION"));
            println!("conclave-core {}", conclave_core::VERSION);
        }
        Commands::Run { config } => run(config, cli.socket_dir).await?,
        Commands::Health { node } => {
            client().health_check(&node).await?;
            println!("{}: ready", node);
        }
        Commands::Metrics { node, format } => {
            let metrics = client().metrics(&node, format.into()).await?;
            match metrics.as_str() {
                Some(text) => print!("{}", text),
                None => println!("{}", serde_json::to_string_pretty(&metrics)?),
            }
        }
        Commands::Shutdown { node } => {
            client().shutdown(&node).await?;
            println!("{}: shutting down", node);
        }
        Commands::Events { node } => {
            let mut events = client().subscribe_events(&node).await?;
            while let Some(event) = events.next_event().await {
                println!("{}", serde_json::to_string(&event?)?);
            }
        }
        Commands::Connect { from, to, port } => {
            match client().connect(&from, &to, &node_endpoint(port)).await? {
                ResponseStatus::Connected => println!("{} -> {}: connected", from, to),
                status => bail!("{} refused connection to {}: {:?}", from, to, status),
            }
        }
    }

    Ok(())
}

async fn run(path: Option<PathBuf>, socket_dir: Option<PathBuf>) -> Result<()> {
    let mut config = match &path {
        Some(path) => ConclaveConfig::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => ConclaveConfig::load()?,
    };
    if let Some(dir) = socket_dir {
        config.supervisor.socket_dir = dir;
    }
    if config.nodes.is_empty() {
        bail!("No nodes configured");
    }

    let supervisor = NodeSupervisor::from_config(&config).await?;
    info!(
        "Starting fleet of {} nodes (sockets: {})",
        config.nodes.len(),
        config.supervisor.socket_dir.display()
    );

    if let Err(e) = supervisor.start_all(true).await {
        error!("Fleet startup failed: {}", e);
        supervisor.stop_all().await;
        return Err(e.into());
    }
    supervisor.start_monitoring(config.recovery.clone()).await;

    for (name, status) in supervisor.get_status().await {
        info!(
            "{}: {} (pid: {:?}, port: {})",
            name, status.status, status.pid, status.port
        );
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Interrupted, stopping fleet");
    supervisor.stop_all().await;
    Ok(())
}
