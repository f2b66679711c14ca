use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use sluice::config::SluiceConfig;
use sluice::http::{router, HttpServer, HttpUpstream};
use sluice::ratelimit::LeakyBucket;

/// Leaky-bucket admission gate in front of an upstream HTTP service.
#[derive(Debug, Parser)]
#[command(name = "sluice", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long, env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match args.log_format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init(),
    }

    info!("Starting Sluice admission gate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = SluiceConfig::load(args.config.as_deref()).map_err(|e| {
        error!(error = %e, "Invalid configuration, refusing to start");
        e
    })?;
    info!(
        listen_addr = %config.server.listen_addr,
        route = %config.server.route,
        capacity = config.bucket.capacity,
        drain_interval_ms = config.bucket.drain_interval_ms,
        upstream = %config.upstream.url,
        "Configuration loaded"
    );

    let bucket = Arc::new(LeakyBucket::from_config(&config.bucket)?);
    info!("Leaky bucket initialized");

    let upstream = Arc::new(HttpUpstream::new(&config.upstream, &config.server)?);
    let app = router(bucket.clone(), upstream, &config.server);

    // Run the server with graceful shutdown on Ctrl+C
    HttpServer::new(config.server.listen_addr, app)
        .serve_with_shutdown(shutdown_signal())
        .await?;

    bucket.shutdown().await;

    info!("Sluice admission gate stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
