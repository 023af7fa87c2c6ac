// The cache, prewarm, and health surfaces are in-process APIs consumed by
// an external serving layer; their call graphs are wired up incrementally.
// Allow dead_code crate-wide until every endpoint is connected.
#![allow(dead_code)]

mod adapter;
mod cache;
mod config;
mod error;
mod health;
mod manifest;
mod sync;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::manager::HttpFetcher;
use crate::cache::{CacheManager, PrewarmQueue};
use crate::health::HealthMonitor;
use crate::sync::SyncScheduler;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "mirrorcache", about = "Mirror synchronization and cache engine")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/mirrorcache/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = %cli.config, "starting mirrorcache");

    // ---- Directories ----
    tokio::fs::create_dir_all(&config.base_dir)
        .await
        .with_context(|| format!("failed to create base dir: {}", config.base_dir.display()))?;

    // ---- Services ----
    let fetch_timeout = Duration::from_secs(config.concurrency.fetch_timeout_secs);
    let cache = Arc::new(
        CacheManager::open(&config.cache, Box::new(HttpFetcher::new(fetch_timeout)))
            .context("failed to open cache")?,
    );

    let health = Arc::new(HealthMonitor::new(config.health.clone()));
    let scheduler =
        SyncScheduler::new(&config, Arc::clone(&health)).context("failed to build scheduler")?;
    let prewarm = PrewarmQueue::new(Arc::clone(&cache), config.prewarm.clone());

    // ---- Background loops ----
    let shutdown = CancellationToken::new();

    prewarm.start(shutdown.clone());

    let scheduler_handle = tokio::spawn({
        let scheduler = scheduler.clone();
        let shutdown = shutdown.clone();
        let tick = Duration::from_secs(config.tick_interval_secs.max(1));
        async move { scheduler.run(tick, shutdown).await }
    });

    let health_handle = tokio::spawn({
        let health = Arc::clone(&health);
        let shutdown = shutdown.clone();
        async move { health.run(shutdown).await }
    });

    // ---- Await shutdown ----
    shutdown_signal().await;
    shutdown.cancel();

    // Drain running passes before exiting so no manifest write is cut off.
    scheduler.shutdown(Duration::from_secs(30)).await;
    let _ = tokio::join!(scheduler_handle, health_handle);

    tracing::info!("mirrorcache shut down cleanly");
    Ok(())
}
