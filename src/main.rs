//! llama-supervisor - lifecycle supervisor for a local llama-server
//!
//! Serves the management API, optionally starts llama-server at boot, and
//! stops it again on Ctrl-C.

use anyhow::{Context, Result};
use clap::Parser;
use llama_supervisor::Config;
use std::path::PathBuf;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "llama-supervisor")]
#[command(about = "Lifecycle supervisor for a local llama-server")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Start llama-server at boot (same as `auto_start` in the config)
    #[arg(long)]
    start: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // llama-server output is logged under the "llama_server" target at debug
    // level, so it can be enabled with e.g. RUST_LOG=info,llama_server=debug.
    let filter = if args.verbose {
        EnvFilter::new("llama_supervisor=debug,llama_server=debug,tower_http=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    info!("Starting llama-supervisor");

    let mut config = Config::from_file(&args.config)
        .await
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate();

    info!(
        port = config.port,
        llama_port = config.llama.port,
        model = ?config.llama.model_path,
        models_dir = ?config.llama.base_path,
        "Configuration loaded"
    );

    let auto_start = args.start || config.auto_start;
    let app = llama_supervisor::build_app(config.clone()).context("Failed to build application")?;

    if let Some(metrics_router) = app.metrics_router.clone() {
        let metrics_addr = format!("0.0.0.0:{}", config.metrics_port);
        let metrics_listener = TcpListener::bind(&metrics_addr)
            .await
            .with_context(|| format!("Failed to bind metrics to {}", metrics_addr))?;
        info!(addr = %metrics_addr, "Serving metrics");
        tokio::spawn(async move {
            if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    // Start in the background so the API is reachable while llama-server loads.
    if auto_start {
        let service = app.service.clone();
        tokio::spawn(async move {
            if let Err(e) = service.start().await {
                error!(error = %e, "llama-server failed to start at boot");
            }
        });
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!(addr = %addr, "Listening for requests");

    let on_signal = app.clone();
    let served = axum::serve(listener, app.router.clone())
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl-C");
            }
            // Streams stay open until the broadcaster closes.
            if let Err(e) = on_signal.shutdown().await {
                error!(error = %e, "Shutdown failed");
            }
        })
        .await
        .context("Server error");

    app.shutdown()
        .await
        .context("Failed to stop llama-server")?;

    served
}
