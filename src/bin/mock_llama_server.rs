//! Mock llama-server for testing llama-supervisor
//!
//! `mock-llama-server --host 127.0.0.1 --port 8080 --mock-models a,b`
//!
//! Serves the subset of the llama-server router API the supervisor uses:
//! `/health`, `/models`, `/models/load` and `/models/unload`. The `--mock-*`
//! flags (passed through `server_args`) script failure modes.

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
};
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "mock-llama-server")]
#[command(about = "Mock llama-server for testing")]
struct Args {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "8080")]
    port: u16,

    /// Single model file (llama-server `-m`); served under its file stem
    #[arg(short = 'm', long = "model")]
    model: Option<PathBuf>,

    /// Models directory (accepted for compatibility)
    #[arg(long)]
    models_dir: Option<PathBuf>,

    /// Comma-separated model ids to serve
    #[arg(long, value_delimiter = ',')]
    mock_models: Vec<String>,

    /// /health answers 503 until this much time has passed
    #[arg(long, default_value = "0")]
    mock_startup_delay_ms: u64,

    /// Exit with status 1 after this long
    #[arg(long)]
    mock_crash_after_ms: Option<u64>,

    /// Ignore SIGTERM (only SIGKILL stops the process)
    #[arg(long)]
    mock_ignore_sigterm: bool,

    /// Model id whose load always fails with 500
    #[arg(long)]
    mock_fail_load: Option<String>,
}

struct MockState {
    ready_at: Instant,
    /// model id -> loaded
    models: RwLock<BTreeMap<String, bool>>,
    fail_load: Option<String>,
}

#[derive(Deserialize)]
struct ModelRequest {
    model: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("mock_llama_server=debug")
        .init();

    let args = Args::parse();

    let mut ids = args.mock_models.clone();
    if let Some(stem) = args
        .model
        .as_ref()
        .and_then(|p| p.file_stem())
        .and_then(|s| s.to_str())
    {
        ids.push(stem.to_string());
    }
    if ids.is_empty() {
        ids.push("test-model".to_string());
    }

    let state = Arc::new(MockState {
        ready_at: Instant::now() + Duration::from_millis(args.mock_startup_delay_ms),
        models: RwLock::new(ids.into_iter().map(|id| (id, false)).collect()),
        fail_load: args.mock_fail_load.clone(),
    });

    if args.mock_ignore_sigterm {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
        tokio::spawn(async move {
            while sigterm.recv().await.is_some() {
                warn!("Ignoring SIGTERM");
            }
        });
    }

    if let Some(ms) = args.mock_crash_after_ms {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            warn!("Simulated crash");
            std::process::exit(1);
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/models", get(list_models))
        .route("/v1/models", get(list_models))
        .route("/models/load", post(load_model))
        .route("/models/unload", post(unload_model))
        .with_state(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr).await?;
    info!(addr = %addr, models_dir = ?args.models_dir, "Mock llama-server listening");

    axum::serve(listener, app).await?;
    Ok(())
}

async fn health(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    if Instant::now() < state.ready_at {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": {"code": 503, "message": "Loading model"}})),
        );
    }
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn list_models(State(state): State<Arc<MockState>>) -> impl IntoResponse {
    let models = state.models.read().await;
    let data: Vec<_> = models
        .iter()
        .map(|(id, loaded)| {
            json!({
                "id": id,
                "object": "model",
                "status": {"value": if *loaded { "loaded" } else { "unloaded" }},
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

async fn load_model(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ModelRequest>,
) -> impl IntoResponse {
    if state.fail_load.as_deref() == Some(body.model.as_str()) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": format!("failed to load {}", body.model)})),
        );
    }

    let mut models = state.models.write().await;
    match models.get_mut(&body.model) {
        Some(loaded) => {
            *loaded = true;
            info!(model = %body.model, "Model loaded");
            (StatusCode::OK, Json(json!({"success": true})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("model {} not found", body.model)})),
        ),
    }
}

async fn unload_model(
    State(state): State<Arc<MockState>>,
    Json(body): Json<ModelRequest>,
) -> impl IntoResponse {
    let mut models = state.models.write().await;
    match models.get_mut(&body.model) {
        Some(loaded) => {
            *loaded = false;
            info!(model = %body.model, "Model unloaded");
            (StatusCode::OK, Json(json!({"success": true})))
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": format!("model {} not found", body.model)})),
        ),
    }
}
