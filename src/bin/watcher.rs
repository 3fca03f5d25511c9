//! Fleet watcher binary

use clap::Parser;
use minigfs::common::Config;
use minigfs::fleet::{FleetWatcher, SshProvisioner};
use minigfs::{coordination, Error};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "minigfs-watcher")]
#[command(about = "minigfs chunkserver fleet watcher")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Coordination endpoints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    coordination: Vec<String>,

    /// Host advertised under the watcher node
    #[arg(long)]
    advertise_host: Option<String>,

    /// Port advertised under the watcher node
    #[arg(long)]
    port: Option<u16>,

    /// Log level when RUST_LOG is not set
    #[arg(long)]
    log_level: Option<String>,
}

/// Exit status when the coordination service cannot be reached at startup
const EXIT_COORDINATION: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load config from file, then override with CLI arguments
    let mut config = Config::load(cli.config.as_deref())?;
    if !cli.coordination.is_empty() {
        config.coordination.endpoints = cli.coordination;
    }
    if let Some(host) = cli.advertise_host {
        config.watcher.advertise_host = Some(host);
    }
    if let Some(port) = cli.port {
        config.watcher.port = port;
    }
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let endpoint = config
        .coordination
        .endpoints
        .first()
        .cloned()
        .unwrap_or_default();
    let provisioner = Arc::new(SshProvisioner::from_config(&config.watcher, &endpoint));

    let started = match coordination::connect(&config).await {
        Ok(gateway) => FleetWatcher::start(gateway, provisioner, &config.watcher).await,
        Err(e) => Err(e),
    };
    let mut handle = match started {
        Ok(handle) => handle,
        Err(e @ (Error::CoordinationUnavailable(_) | Error::Coordination(_))) => {
            tracing::error!("Unable to connect to coordination service, shutting down: {}", e);
            std::process::exit(EXIT_COORDINATION);
        }
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        "minigfs-watcher {} running at {}",
        minigfs::VERSION,
        handle.address()
    );

    tokio::select! {
        res = handle.join() => {
            tracing::warn!("Fleet watcher stopped");
            res?;
        }
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("Shutting down");
        }
    }
    handle.shutdown();

    Ok(())
}
