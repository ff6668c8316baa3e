//! HTTP API.
//!
//! ## Endpoints
//!
//! | Method | Path                         | Description                              |
//! |--------|------------------------------|------------------------------------------|
//! | POST   | `/api/models/{name}/start`   | Admit and load a model                   |
//! | POST   | `/api/models/{name}/stop`    | Unload a model                           |
//! | GET    | `/api/models`                | Models known to llama-server             |
//! | POST   | `/api/models/refresh`        | Re-query the model list                  |
//! | GET    | `/api/llama/status`          | Service state snapshot                   |
//! | POST   | `/api/llama/start`           | Start (or attach to) llama-server        |
//! | POST   | `/api/llama/stop`            | Stop llama-server                        |
//! | POST   | `/api/llama/restart`         | Stop, then start                         |
//! | GET    | `/api/logs`                  | Recent log lines (`?limit=`)             |
//! | GET    | `/api/analytics`             | Analytics snapshot                       |
//! | GET    | `/api/analytics/stream`      | Analytics snapshots over SSE             |
//! | GET    | `/api/ws`                    | Broadcast envelopes over WebSocket       |
//! | GET    | `/health`                    | Liveness of the supervisor itself        |

use crate::admission::{AdmissionError, AdmissionGuard, ServiceRegistry, StartRequest};
use crate::analytics::{Analytics, snapshot_stream};
use crate::broadcast::{Broadcaster, Envelope, Message};
use crate::logs::LogBuffer;
use crate::service::{LlamaService, ServiceError};
use axum::extract::ws::{self, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

/// Lines returned by `/api/logs` without `?limit=`
const DEFAULT_LOG_LIMIT: usize = 100;

/// Shared handles for every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: ServiceRegistry,
    pub admission: AdmissionGuard,
    pub analytics: Arc<Analytics>,
    pub broadcaster: Broadcaster,
    pub logs: Arc<LogBuffer>,
    pub analytics_interval: Duration,
}

/// Build the API router.
pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/models", get(list_models))
        .route("/api/models/refresh", post(refresh_models))
        .route("/api/models/{name}/start", post(start_model))
        .route("/api/models/{name}/stop", post(stop_model))
        .route("/api/llama/status", get(llama_status))
        .route("/api/llama/start", post(llama_start))
        .route("/api/llama/stop", post(llama_stop))
        .route("/api/llama/restart", post(llama_restart))
        .route("/api/logs", get(recent_logs))
        .route("/api/analytics", get(analytics_snapshot))
        .route("/api/analytics/stream", get(analytics_stream))
        .route("/api/ws", get(websocket))
        .route("/health", get(health))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
        }),
    )
}

fn not_initialized() -> ApiError {
    api_error(
        StatusCode::SERVICE_UNAVAILABLE,
        AdmissionError::NotInitialized.to_string(),
    )
}

fn service_error(error: ServiceError) -> ApiError {
    let status = match error {
        ServiceError::Stopping | ServiceError::NotOwned => StatusCode::CONFLICT,
        ServiceError::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    api_error(status, error.to_string())
}

#[derive(Deserialize)]
struct LogsQuery {
    limit: Option<usize>,
}

impl AppState {
    fn service(&self) -> Result<LlamaService, ApiError> {
        self.registry.get().ok_or_else(not_initialized)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn start_model(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Response {
    let mut request = if body.iter().all(u8::is_ascii_whitespace) {
        StartRequest::default()
    } else {
        match serde_json::from_slice::<StartRequest>(&body) {
            Ok(request) => request,
            Err(e) => {
                return AdmissionError::Validation(vec![format!("Invalid request body: {e}")])
                    .into_response();
            }
        }
    };
    if !name.trim().is_empty() {
        request.model = name;
    }

    match state.admission.start_model(request).await {
        Ok(payload) => {
            state
                .broadcaster
                .publish(Message::ModelStatus(json!({
                    "model": payload["model"],
                    "status": "loaded",
                })));
            Json(payload).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn stop_model(State(state): State<AppState>, Path(name): Path<String>) -> Response {
    match state.admission.stop_model(&name).await {
        Ok(payload) => {
            state
                .broadcaster
                .publish(Message::ModelStatus(json!({
                    "model": payload["model"],
                    "status": "unloaded",
                })));
            Json(payload).into_response()
        }
        Err(e) => e.into_response(),
    }
}

async fn list_models(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state.service()?.state();
    Ok(Json(json!({
        "status": snapshot.status,
        "models": snapshot.models,
    })))
}

async fn refresh_models(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let models = state
        .service()?
        .refresh_models()
        .await
        .map_err(service_error)?;
    Ok(Json(json!({ "models": models })))
}

async fn llama_status(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.service()?.state()))
}

async fn llama_start(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let service = state.service()?;
    service.start().await.map_err(service_error)?;
    Ok(Json(service.state()))
}

async fn llama_stop(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let service = state.service()?;
    service.stop().await.map_err(service_error)?;
    Ok(Json(service.state()))
}

async fn llama_restart(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let service = state.service()?;
    service.restart().await.map_err(service_error)?;
    Ok(Json(service.state()))
}

async fn recent_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(DEFAULT_LOG_LIMIT);
    Json(json!({ "logs": state.logs.recent(limit) }))
}

async fn analytics_snapshot(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.analytics.snapshot().await)
}

async fn analytics_stream(State(state): State<AppState>) -> impl IntoResponse {
    // Ends with the broadcaster so graceful shutdown is not held open.
    let stream = snapshot_stream(state.analytics.clone(), state.analytics_interval)
        .take_until(state.broadcaster.closed())
        .map(|envelope| Event::default().json_data(envelope));
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn websocket(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| serve_socket(socket, state))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Push broadcast envelopes to one client until either side goes away.
async fn serve_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.broadcaster.subscribe();
    debug!(
        clients = state.broadcaster.subscriber_count(),
        "WebSocket client connected"
    );

    // New clients get the current status without waiting for a change.
    if let Some(service) = state.registry.get() {
        let initial = Envelope::new("llama_status", service.state());
        if let Ok(json) = serde_json::to_string(&initial)
            && socket.send(ws::Message::Text(json.into())).await.is_err()
        {
            return;
        }
    }

    loop {
        tokio::select! {
            _ = state.broadcaster.closed() => break,
            envelope = rx.recv() => match envelope {
                Ok(json) => {
                    if socket.send(ws::Message::Text((&*json).into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "WebSocket client lagging, envelopes skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(ws::Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let _ = socket.send(ws::Message::Close(None)).await;
    debug!("WebSocket client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientError, LlamaApi};
    use crate::config::LlamaServerConfig;
    use crate::types::ModelInfo;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    struct FakeApi;

    #[async_trait]
    impl LlamaApi for FakeApi {
        async fn health_check(&self) -> bool {
            true
        }

        async fn load_models(&self) -> Vec<ModelInfo> {
            vec![ModelInfo {
                id: "tiny".to_string(),
                name: "tiny.gguf".to_string(),
                size: 1,
                kind: "gguf".to_string(),
                path: "/models/tiny.gguf".to_string(),
                modified_at: None,
                status: None,
            }]
        }

        async fn load_model(&self, _: &str, _: Option<&str>) -> Result<Value, ClientError> {
            Err(ClientError::Connect("connection refused".to_string()))
        }

        async fn unload_model(&self, _: &str) -> Result<Value, ClientError> {
            Ok(json!({"success": true}))
        }
    }

    fn test_state(service: Option<LlamaService>) -> AppState {
        let registry = ServiceRegistry::new();
        if let Some(service) = service {
            registry.register(service);
        }
        let broadcaster = Broadcaster::new();
        AppState {
            admission: AdmissionGuard::new(registry.clone(), 1),
            registry,
            analytics: Arc::new(Analytics::new("/nonexistent/logs")),
            logs: Arc::new(LogBuffer::new(10, Some(broadcaster.clone()))),
            broadcaster,
            analytics_interval: Duration::from_secs(5),
        }
    }

    async fn ready_service() -> LlamaService {
        let service =
            LlamaService::with_api(LlamaServerConfig::default(), Arc::new(FakeApi), None);
        service.start().await.unwrap();
        service
    }

    async fn call(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_start_without_service_is_503() {
        let app = api_router(test_state(None));
        let (status, body) = call(app, "POST", "/api/models/tiny/start", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Llama service not initialized");
    }

    #[tokio::test]
    async fn test_start_unknown_model_is_404() {
        let app = api_router(test_state(Some(ready_service().await)));
        let (status, body) = call(app, "POST", "/api/models/huge/start", "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, json!({"error": "Model not found", "model": "huge"}));
    }

    #[tokio::test]
    async fn test_start_connect_failure_is_500() {
        let app = api_router(test_state(Some(ready_service().await)));
        let (status, body) = call(app, "POST", "/api/models/tiny/start", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Failed to connect to llama-server");
        assert_eq!(body["details"], "connection refused");
    }

    #[tokio::test]
    async fn test_start_malformed_body_is_400() {
        let app = api_router(test_state(Some(ready_service().await)));
        let (status, body) = call(app, "POST", "/api/models/tiny/start", "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["details"].as_array().is_some_and(|d| !d.is_empty()));
    }

    #[tokio::test]
    async fn test_not_ready_reports_status() {
        let service =
            LlamaService::with_api(LlamaServerConfig::default(), Arc::new(FakeApi), None);
        let app = api_router(test_state(Some(service)));
        let (status, body) = call(app, "POST", "/api/models/tiny/start", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Llama server is not ready (status: initial)");
    }

    #[tokio::test]
    async fn test_status_and_models() {
        let state = test_state(Some(ready_service().await));

        let (status, body) = call(api_router(state.clone()), "GET", "/api/llama/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ready");
        assert_eq!(body["retries"], 0);

        let (status, body) = call(api_router(state), "GET", "/api/models", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["models"][0]["id"], "tiny");
        assert_eq!(body["models"][0]["type"], "gguf");
    }

    #[tokio::test]
    async fn test_refresh_when_not_ready_is_503() {
        let service =
            LlamaService::with_api(LlamaServerConfig::default(), Arc::new(FakeApi), None);
        let app = api_router(test_state(Some(service)));
        let (status, _) = call(app, "POST", "/api/models/refresh", "").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_logs_respect_limit() {
        let state = test_state(None);
        for i in 0..5 {
            state.logs.info("test", format!("line {i}"));
        }
        let (status, body) = call(api_router(state), "GET", "/api/logs?limit=2", "").await;
        assert_eq!(status, StatusCode::OK);
        let logs = body["logs"].as_array().unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[1]["message"], "line 4");
    }

    #[tokio::test]
    async fn test_analytics_snapshot() {
        let state = test_state(None);
        state.analytics.inc_request();
        let (status, body) = call(api_router(state), "GET", "/api/analytics", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["totalRequests"], 1);
        assert_eq!(body["errorRate"], 0.0);
    }

    #[tokio::test]
    async fn test_analytics_stream_first_event_is_immediate() {
        let app = api_router(test_state(None));
        let request = Request::builder()
            .uri("/api/analytics/stream")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");

        let mut frames = response.into_body().into_data_stream();
        let first = frames.next().await.unwrap().unwrap();
        let text = std::str::from_utf8(&first).unwrap();
        assert!(text.starts_with("data: "));
        assert!(text.ends_with("\n\n"));

        let envelope: Value = serde_json::from_str(text.trim_start_matches("data: ").trim()).unwrap();
        assert_eq!(envelope["type"], "analytics");
        assert!(envelope["timestamp"].is_i64());
        assert!(envelope["data"]["uptime"].is_u64());
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(api_router(test_state(None)), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }
}
