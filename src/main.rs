use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use image_proxy::{
    config::Config,
    database::{Database, repositories::CacheIndexRepository},
    services::{CacheService, HttpFetcher, ReconciliationLoop},
    storage::TieredStore,
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "image-proxy")]
#[command(version)]
#[command(about = "An image transformation proxy with a tiered cache")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(cli: &Cli) {
    let log_filter = if cli.log_level == "trace" {
        format!("image_proxy={},tower_http=trace", cli.log_level)
    } else {
        format!("image_proxy={},tower_http=info", cli.log_level)
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_filter.into());

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
                return;
            }
            _ => error!("Failed to install unix signal handlers, falling back to Ctrl+C"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down gracefully"),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    info!("Starting image proxy v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load_from_file(&cli.config)?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }

    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;

    let store = Arc::new(TieredStore::from_config(&config.storage).await?);
    let index = CacheIndexRepository::new(database.connection())
        .with_batch_size(config.reconciliation.sync_batch_size);
    let fetcher = Arc::new(HttpFetcher::new(&config.upstream)?);
    let cache = Arc::new(CacheService::new(&config, store, index, fetcher));

    if cache.is_enabled() {
        let loaded = cache.load_from_index().await?;
        info!("Warmed memory cache with {} entries from the index", loaded);
    }

    let cancellation_token = CancellationToken::new();
    let reconciliation =
        ReconciliationLoop::new(cache.clone(), &config.reconciliation).spawn(cancellation_token.clone());

    let signal_token = cancellation_token.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    let web_server = WebServer::new(&config, cache.clone())?;
    info!("Web server starting on http://{}:{}", web_server.host(), web_server.port());
    let served = web_server.serve_with_cancellation(cancellation_token.clone()).await;

    // Stop the loop even when the server failed to start
    cancellation_token.cancel();
    if let Err(e) = reconciliation.await {
        error!("Reconciliation task ended abnormally: {}", e);
    }
    cache.shutdown().await;

    served?;
    info!("Shutdown complete");
    Ok(())
}
