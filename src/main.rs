/// Ferrite - disposable Kubernetes clusters in containers
///
/// Provisions multi-node Kubernetes clusters where every node is a
/// container, over Docker or Podman.
mod cluster;
mod config;
mod runtime;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::cluster::{ClusterCreator, ClusterManager};
use crate::config::{ClusterConfig, CreateOptions};

#[derive(Parser)]
#[command(name = "ferrite")]
#[command(about = "Run disposable Kubernetes clusters in containers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new cluster
    Create {
        /// Cluster name, overrides the configuration file
        #[arg(long)]
        name: Option<String>,

        /// Configuration file path
        #[arg(short, long, default_value = "cluster.yaml")]
        config: PathBuf,

        /// Node image override applied to every node
        #[arg(long)]
        image: Option<String>,

        /// Retain nodes for debugging when creation fails
        #[arg(long)]
        retain: bool,

        /// Seconds to wait for the control plane to be ready (0 = no wait)
        #[arg(long, default_value_t = 0)]
        wait: u64,
    },

    /// Delete an existing cluster
    Delete {
        /// Cluster name
        name: String,
    },

    /// List clusters known to the backend
    List,

    /// Show a cluster's nodes
    Nodes {
        /// Cluster name
        name: String,
    },

    /// Collect diagnostic logs from a cluster's nodes
    Logs {
        /// Cluster name
        name: String,

        /// Output directory, one subdirectory per node
        #[arg(short, long, default_value = "./logs")]
        dir: PathBuf,
    },

    /// Generate an example configuration file
    Init {
        /// Configuration file path
        #[arg(short, long, default_value = "cluster.yaml")]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("ferrite={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let result = match cli.command {
        Commands::Create {
            ref name,
            ref config,
            ref image,
            retain,
            wait,
        } => create_cluster(name.clone(), config, image.clone(), retain, wait).await,
        Commands::Delete { ref name } => delete_cluster(name).await,
        Commands::List => list_clusters().await,
        Commands::Nodes { ref name } => show_nodes(name).await,
        Commands::Logs { ref name, ref dir } => collect_logs(name, dir).await,
        Commands::Init { ref config } => init_config(config).await,
    };

    if let Err(e) = result {
        error!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Load the topology file, falling back to a single-node default
fn load_config(path: &PathBuf) -> Result<ClusterConfig> {
    if path.exists() {
        ClusterConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    } else {
        info!(
            "No configuration at {}, using a single control-plane node",
            path.display()
        );
        Ok(ClusterConfig::minimal())
    }
}

/// Create a new cluster
async fn create_cluster(
    name: Option<String>,
    config_path: &PathBuf,
    image: Option<String>,
    retain: bool,
    wait: u64,
) -> Result<()> {
    let config = load_config(config_path)?;
    let opts = CreateOptions {
        name,
        image,
        retain,
        wait: Duration::from_secs(wait),
    };

    let provider = runtime::detect().await?;
    info!("Using {} as the container runtime backend", provider.name());

    let creator = ClusterCreator::new(provider.as_ref());
    let created = creator.create(&config, &opts).await?;

    info!("✓ Cluster {} created", created.name);
    info!("");
    info!("Cluster details:");
    info!("  Name: {}", created.name);
    info!("  Nodes: {}", created.nodes.len());
    info!("  API server: https://{}", created.api_server_endpoint);
    info!(
        "  In-cluster API server: https://{}",
        created.api_server_internal_endpoint
    );
    info!("");
    info!("Next steps:");
    info!("  ferrite nodes {}", created.name);
    info!("  ferrite delete {}", created.name);

    Ok(())
}

/// Delete an existing cluster
async fn delete_cluster(name: &str) -> Result<()> {
    let provider = runtime::detect().await?;
    let manager = ClusterManager::new(provider.as_ref());
    manager.delete_cluster(name).await?;
    info!("✓ Cluster {} deleted", name);
    Ok(())
}

/// List clusters known to the backend
async fn list_clusters() -> Result<()> {
    let provider = runtime::detect().await?;
    let manager = ClusterManager::new(provider.as_ref());
    for name in manager.list_clusters().await? {
        println!("{}", name);
    }
    Ok(())
}

/// Show a cluster's nodes
async fn show_nodes(name: &str) -> Result<()> {
    let provider = runtime::detect().await?;
    let manager = ClusterManager::new(provider.as_ref());
    for node in manager.cluster_nodes(name).await? {
        println!("{}\t{}\t{}", node.name, node.role, node.state);
    }
    Ok(())
}

/// Collect diagnostic logs from a cluster's nodes
async fn collect_logs(name: &str, dir: &PathBuf) -> Result<()> {
    let provider = runtime::detect().await?;
    let manager = ClusterManager::new(provider.as_ref());
    manager.collect_logs(name, dir).await?;
    info!("✓ Logs collected into {}", dir.display());
    Ok(())
}

/// Generate an example configuration file
async fn init_config(path: &PathBuf) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Configuration file already exists: {}", path.display());
    }

    let example = ClusterConfig::example();
    let yaml = serde_yaml::to_string(&example)?;

    tokio::fs::write(path, yaml)
        .await
        .context("Failed to write configuration file")?;

    info!("Example configuration created: {}", path.display());
    info!("");
    info!("Next steps:");
    info!("  1. Edit the configuration to match your topology");
    info!("  2. Create the cluster:");
    info!("     ferrite create --config {}", path.display());

    Ok(())
}
