use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::{Parser, Subcommand};
use tracing::{error, info};

use bpi_core::{NodeConfig, NodeSupervisor};

/// BPI node: CVM execution, reputation/trust engine, and L2 sequencer network.
#[derive(Parser)]
#[command(name = "bpi-core")]
#[command(about = "Reputation-gated CVM execution and permissionless L2 sequencer node")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose (debug) logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (TOML). Overridden by BPI_* env vars.
    #[arg(long, global = true, default_value = "bpi-core.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Node lifecycle management
    #[command(subcommand)]
    Node(NodeCommands),
    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Start the node and serve the Prometheus metrics endpoint until Ctrl-C
    Start,
    /// Open the data directory and report subsystem health, then exit
    Status,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration (file + env overrides) as TOML
    Show,
    /// Write a default configuration file to the given path
    Generate {
        /// Destination path for the generated config
        #[arg(default_value = "bpi-core.toml")]
        path: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    info!("Starting bpi-core");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let result = match &cli.command {
        Commands::Node(cmd) => handle_node_command(cmd, &cli.config).await,
        Commands::Config(cmd) => handle_config_command(cmd, &cli.config).await,
    };

    if let Err(e) = result {
        error!("command failed: {e}");
        std::process::exit(1);
    }

    Ok(())
}

fn init_logging(verbose: bool) -> Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let level = if verbose { tracing::Level::DEBUG } else { tracing::Level::INFO };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_ids(false))
        .with(tracing_subscriber::filter::LevelFilter::from_level(level))
        .init();

    Ok(())
}

async fn handle_node_command(cmd: &NodeCommands, config_path: &str) -> Result<()> {
    match cmd {
        NodeCommands::Start => {
            let config = NodeConfig::load(config_path)?;
            start_node(config).await?;
        }
        NodeCommands::Status => {
            let config = NodeConfig::load(config_path)?;
            let node = NodeSupervisor::open(config)?;
            node.refresh_gauges();
            println!(
                "{}",
                serde_json::json!({
                    "data_dir": node.config.data_dir,
                    "l2_chain_id": node.config.l2_chain_id,
                    "mempool_size": node.mempool.lock().unwrap().len(),
                })
            );
        }
    }
    Ok(())
}

async fn handle_config_command(cmd: &ConfigCommands, config_path: &str) -> Result<()> {
    match cmd {
        ConfigCommands::Show => {
            let config = NodeConfig::load(config_path)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigCommands::Generate { path } => {
            let config = NodeConfig::default();
            std::fs::write(path, toml::to_string_pretty(&config)?)?;
            println!("Wrote default configuration to {path}");
        }
    }
    Ok(())
}

/// Opens the node supervisor and serves `/metrics` until interrupted.
///
/// The JSON status dashboard is out of scope for this crate (SPEC_FULL.md §6);
/// this only mounts the `prometheus::Registry` the supervisor already built.
async fn start_node(config: NodeConfig) -> Result<()> {
    let metrics_bind = config.metrics_bind.clone();
    let node = Arc::new(NodeSupervisor::open(config)?);

    let app = Router::new().route("/metrics", get(metrics_handler)).with_state(node.clone());

    info!("serving metrics on {metrics_bind}");
    let listener = tokio::net::TcpListener::bind(&metrics_bind).await?;

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!("metrics server failed: {e}");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down bpi-core");
        }
    }

    Ok(())
}

async fn metrics_handler(State(node): State<Arc<NodeSupervisor>>) -> impl IntoResponse {
    node.refresh_gauges();
    node.metrics.encode()
}
