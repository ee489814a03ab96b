mod admin_api;
mod analytics;
mod config;
mod error;
mod models;
mod protection;
mod proxy;
mod storage;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::admin_api::routes::AppState;
use crate::admin_api::server::AdminApiServer;
use crate::analytics::collector::MetricsCollector;
use crate::config::settings::{Settings, StorageBackend};
use crate::protection::pipeline::ProtectionPipeline;
use crate::proxy::http_handler::HttpHandler;
use crate::proxy::server::ProxyServer;
use crate::storage::memory::MemoryReputationStore;
use crate::storage::sqlite::SqliteReputationStore;
use crate::storage::ReputationStore;

/// Inline request-filtering reverse proxy.
#[derive(Debug, Parser)]
#[command(name = "shieldwall", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "/etc/shieldwall/shieldwall.toml")]
    config: String,
}

/// Initialise the `tracing` subscriber with both stdout and file output.
fn init_tracing(default_filter: &str, log_file: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let stdout_layer = fmt::layer().with_writer(std::io::stdout).with_target(true);

    let file = std::path::Path::new(log_file);
    if let Some(dir) = file.parent() {
        let _ = std::fs::create_dir_all(dir);
    }
    let file_layer = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(file)
        .ok()
        .map(|log_file| {
            fmt::layer()
                .with_writer(log_file)
                .with_ansi(false)
                .with_target(true)
        });
    let file_failed = file_layer.is_none();

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .init();

    if file_failed {
        warn!(path = %log_file, "Could not open log file, logging to stdout only");
    }
}

fn open_store(settings: &Settings) -> anyhow::Result<Arc<dyn ReputationStore>> {
    match settings.storage.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryReputationStore::new())),
        StorageBackend::Sqlite => {
            let store = SqliteReputationStore::open(&settings.storage.sqlite_path).with_context(|| {
                format!("Failed to open reputation store at {}", settings.storage.sqlite_path)
            })?;
            Ok(Arc::new(store))
        }
    }
}

/// Periodic sweep of expired pipeline state.
async fn maintenance_loop(pipeline: Arc<ProtectionPipeline>, metrics: Arc<MetricsCollector>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        pipeline.run_maintenance();
        metrics.reset_ip_counts();
    }
}

async fn metrics_tick_loop(metrics: Arc<MetricsCollector>) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    loop {
        interval.tick().await;
        metrics.tick();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---------------------------------------------------------------
    // 1. Configuration
    // ---------------------------------------------------------------
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)?;

    // ---------------------------------------------------------------
    // 2. Logging
    // ---------------------------------------------------------------
    init_tracing(&settings.logging.level, &settings.logging.file);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting Shieldwall");
    info!(config = %cli.config, "Config loaded");

    // ---------------------------------------------------------------
    // 3. Storage and pipeline
    // ---------------------------------------------------------------
    let store = open_store(&settings)?;
    info!(backend = ?settings.storage.backend, "Reputation store ready");

    let pipeline = Arc::new(
        ProtectionPipeline::new(&settings, store).context("Failed to build protection pipeline")?,
    );
    let metrics = Arc::new(MetricsCollector::new());

    // ---------------------------------------------------------------
    // 4. Proxy
    // ---------------------------------------------------------------
    let handler = Arc::new(HttpHandler::new(Arc::clone(&pipeline), Arc::clone(&metrics), &settings));
    let proxy_server = ProxyServer::new(&settings.server, handler);

    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy_server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    // ---------------------------------------------------------------
    // 5. Admin API (disabled without a key)
    // ---------------------------------------------------------------
    let admin_handle = if settings.admin_api.api_key.is_empty() {
        warn!("admin_api.api_key is empty, admin API disabled");
        None
    } else {
        let admin_state = AppState {
            pipeline: Arc::clone(&pipeline),
            metrics: Arc::clone(&metrics),
            api_key: settings.admin_api.api_key.clone(),
        };
        let admin_server = AdminApiServer::new(admin_state, settings.admin_api.bind.clone());
        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin API server error");
            }
        }))
    };

    // ---------------------------------------------------------------
    // 6. Background tasks
    // ---------------------------------------------------------------
    let maintenance_handle = tokio::spawn(maintenance_loop(
        Arc::clone(&pipeline),
        Arc::clone(&metrics),
        Duration::from_secs(settings.protection.maintenance_interval_secs.max(1)),
    ));
    let tick_handle = tokio::spawn(metrics_tick_loop(Arc::clone(&metrics)));

    info!("Shieldwall is running. Press Ctrl+C to shut down.");

    // ---------------------------------------------------------------
    // 7. Wait for shutdown signal
    // ---------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Shutting down Shieldwall...");

    proxy_handle.abort();
    if let Some(handle) = admin_handle {
        handle.abort();
    }
    maintenance_handle.abort();
    tick_handle.abort();

    info!("Shieldwall shut down");
    Ok(())
}
