//! HTTPS Credentials - node TLS credential manager
//!
//! Loads `config.toml`, restores each node's credentials and serves the admin
//! API. Nodes that had HTTPS enabled get their TLS listener back on start-up.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use https_credentials::configs::{AppConfig, LogFormat};
use https_credentials::controller::NodeRegistry;
use https_credentials::webserver;

#[derive(Parser, Debug)]
#[command(name = "https-credentials", version, about)]
struct Args {
    /// Configuration file (defaults to ./config.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON regardless of the configured format
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(config: &AppConfig, json_logs: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone()));

    let registry = tracing_subscriber::registry().with(filter);
    if json_logs || config.logging.format == LogFormat::Json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::load()?,
    };
    init_tracing(&config, args.json_logs);

    info!(
        nodes = config.nodes.len(),
        default_node = %config.default_node_id(),
        persistence = config.storage.data_dir.is_some(),
        "Starting HTTPS credential manager"
    );

    let registry = NodeRegistry::from_config(&config).context("Failed to initialize nodes")?;
    webserver::start_webserver(config, registry).await
}
