//! Social Harvest - Main Entry Point
//!
//! Runs the harvest schedule, the storage workers and the HTTP API.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;

use social_harvest::config::AppConfig;
use social_harvest::harvest::LoggingAdapter;
use social_harvest::logging::init_tracing;
use social_harvest::server::create_app;

// Use mimalloc for better performance
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(name = "social-harvest")]
#[command(about = "Social Harvest - territory harvesting scheduler and live record streams")]
#[command(version)]
struct Args {
    /// Config file path (JSON, YAML or TOML).
    #[arg(short, long, env = "SOCIAL_HARVEST_CONF")]
    conf: Option<PathBuf>,

    /// Host to bind to, overrides `server.host`.
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on, overrides `server.port`.
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level, overrides `logging.level`.
    #[arg(long)]
    log_level: Option<String>,

    /// Emit JSON logs.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let mut config = AppConfig::load(args.conf.as_deref())?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.logging.json |= args.json_logs;

    init_tracing(&config.logging)?;
    tracing::info!("Configuration loaded");

    let addr = config.server.bind_address();
    let disabled = config.server.disabled;

    let shutdown = CancellationToken::new();
    let (app, orchestrator) = create_app(config, Arc::new(LoggingAdapter), &shutdown).await?;

    if disabled {
        tracing::info!("API server disabled; running schedule only");
        shutdown_signal().await;
    } else {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on {}", addr);

        let token = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown_signal().await;
                // Ends open streams so graceful shutdown can complete
                token.cancel();
            })
            .await?;
    }

    shutdown.cancel();
    orchestrator.shutdown().await;

    tracing::info!("Social Harvest shut down gracefully");
    Ok(())
}

/// Graceful shutdown signal handler.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }
}
