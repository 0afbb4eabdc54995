use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod config;
mod plugin;
mod plugins;
#[cfg(test)]
mod test_support;

use crate::config::{FileConfig, SkywatchConfig, load_config, sync_config_from_file};
use skywatch_sync::SyncContext;

#[derive(Parser)]
#[command(name = "skywatch")]
#[command(about = "Realtime aircraft and vessel tracking host")]
struct Cli {
    /// Custom data directory (defaults to ~/.skywatch)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// HTTP base URL of the backend (overrides config.toml)
    #[arg(long)]
    base_url: Option<String>,

    /// WebSocket URL of the backend (overrides config.toml)
    #[arg(long)]
    socket_url: Option<String>,

    /// Entity ids to follow, comma separated
    #[arg(long, value_delimiter = ',')]
    follow: Vec<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "skywatch=debug,skywatch_sync=debug,info"
    } else {
        "skywatch=info,skywatch_sync=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Skywatch");

    let config = SkywatchConfig::new(cli.data_dir.clone())?;
    let mut file_config: FileConfig = load_config(&config.data_dir)
        .extract()
        .with_context(|| format!("Invalid config in {}", config.config_toml_path().display()))?;

    if let Some(base_url) = cli.base_url {
        file_config.backend.base_url = base_url;
    }
    if let Some(socket_url) = cli.socket_url {
        file_config.backend.socket_url = socket_url;
    }
    file_config.plugins.follow.extend(cli.follow);

    let sync_config = sync_config_from_file(&file_config);
    info!("Backend: {}", sync_config.socket_url);

    let ctx = Arc::new(SyncContext::connect(sync_config));
    let responder = ctx.spawn_trajectory_responder();

    // Plugins keep retrying their subscriptions in the background; an early
    // connect only surfaces a misconfigured backend sooner.
    if let Err(e) = ctx.realtime().connect().await {
        warn!("Initial connect failed, plugins keep retrying in the background: {}", e);
    }

    let registry = plugins::builtin(&file_config.plugins);
    let running = registry.start_all(ctx.clone()).await;
    info!("{} of {} plugins running", running.len(), registry.len());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received shutdown signal, cleaning up...");

    for (name, handle) in running {
        info!("Stopping plugin {}", name);
        handle.shutdown();
    }
    responder.abort();
    ctx.realtime().disconnect().await;

    info!("Shutdown complete");
    Ok(())
}
