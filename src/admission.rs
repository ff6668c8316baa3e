//! Admission control for "start model X" requests.
//!
//! A hard gate, not a queue: a request that would exceed
//! `max_concurrent_models` fails immediately with 409. The whole
//! check-count-forward sequence runs under one async lock, so concurrent
//! requests always observe a consistent model list.

use crate::client::ClientError;
use crate::service::LlamaService;
use crate::types::{LlamaServiceState, ModelInfo, ServiceStatus};
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    #[error("Validation failed: {}", .0.join(", "))]
    Validation(Vec<String>),

    #[error("Llama service not initialized")]
    NotInitialized,

    #[error("Llama server is not ready (status: {0})")]
    NotReady(ServiceStatus),

    #[error("Maximum concurrent models ({0}) reached")]
    MaxConcurrent(usize),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to connect to llama-server")]
    ConnectFailed(String),

    #[error("Failed to load model")]
    LoadFailed(String),

    #[error("Failed to unload model")]
    UnloadFailed(String),
}

impl AdmissionError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdmissionError::Validation(_) => StatusCode::BAD_REQUEST,
            AdmissionError::NotInitialized | AdmissionError::NotReady(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AdmissionError::MaxConcurrent(_) => StatusCode::CONFLICT,
            AdmissionError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            AdmissionError::ConnectFailed(_)
            | AdmissionError::LoadFailed(_)
            | AdmissionError::UnloadFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used for the rejection metric
    fn reason(&self) -> &'static str {
        match self {
            AdmissionError::Validation(_) => "validation",
            AdmissionError::NotInitialized => "not_initialized",
            AdmissionError::NotReady(_) => "not_ready",
            AdmissionError::MaxConcurrent(_) => "max_concurrent",
            AdmissionError::ModelNotFound(_) => "not_found",
            AdmissionError::ConnectFailed(_) => "connect_failed",
            AdmissionError::LoadFailed(_) => "load_failed",
            AdmissionError::UnloadFailed(_) => "unload_failed",
        }
    }

    /// JSON error body; upstream details are passed through untouched.
    pub fn body(&self) -> Value {
        match self {
            AdmissionError::Validation(details) => {
                json!({ "error": "Validation failed", "details": details })
            }
            AdmissionError::ModelNotFound(model) => {
                json!({ "error": "Model not found", "model": model })
            }
            AdmissionError::ConnectFailed(details)
            | AdmissionError::LoadFailed(details)
            | AdmissionError::UnloadFailed(details) => {
                json!({ "error": self.to_string(), "details": details })
            }
            other => json!({ "error": other.to_string() }),
        }
    }

    fn from_client(error: ClientError, failed: fn(String) -> AdmissionError) -> Self {
        match error {
            ClientError::Connect(e) => AdmissionError::ConnectFailed(e),
            ClientError::Status { body, .. } => failed(body),
            ClientError::Decode(e) => failed(e),
        }
    }
}

impl IntoResponse for AdmissionError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(self.body())).into_response()
    }
}

/// Body of a start request. The model id normally comes from the path.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub template: Option<String>,
}

impl StartRequest {
    fn validate(&self) -> Result<(), AdmissionError> {
        let mut details = Vec::new();
        if self.model.trim().is_empty() {
            details.push("Model name is required".to_string());
        }
        if self.template.as_deref().is_some_and(|t| t.trim().is_empty()) {
            details.push("Template must not be empty when provided".to_string());
        }
        if details.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::Validation(details))
        }
    }
}

/// Steps (2)-(5) of admission against a state snapshot: returns the
/// resolved model or the rejection.
pub fn check_admission(
    name: &str,
    state: Option<&LlamaServiceState>,
    max_concurrent: usize,
) -> Result<ModelInfo, AdmissionError> {
    let state = state.ok_or(AdmissionError::NotInitialized)?;

    if state.status != ServiceStatus::Ready {
        return Err(AdmissionError::NotReady(state.status));
    }

    let running = state.models.iter().filter(|m| m.is_running()).count();
    if running >= max_concurrent {
        return Err(AdmissionError::MaxConcurrent(max_concurrent));
    }

    resolve_model(name, &state.models)
}

/// Exact, case-sensitive match on id or name
fn resolve_model(name: &str, models: &[ModelInfo]) -> Result<ModelInfo, AdmissionError> {
    models
        .iter()
        .find(|m| m.id == name || m.name == name)
        .cloned()
        .ok_or_else(|| AdmissionError::ModelNotFound(name.to_string()))
}

/// Holds the (at most one) registered llama service.
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    service: Arc<RwLock<Option<LlamaService>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, service: LlamaService) {
        let mut slot = self
            .service
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(service);
    }

    pub fn get(&self) -> Option<LlamaService> {
        self.service
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

/// Gate in front of the llama-server load/unload API.
#[derive(Clone)]
pub struct AdmissionGuard {
    registry: ServiceRegistry,
    max_concurrent: usize,
    lock: Arc<Mutex<()>>,
}

impl AdmissionGuard {
    pub fn new(registry: ServiceRegistry, max_concurrent: usize) -> Self {
        Self {
            registry,
            max_concurrent,
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// Admit and load a model. Returns `{model, status: "loaded", response}`.
    pub async fn start_model(&self, request: StartRequest) -> Result<Value, AdmissionError> {
        let result = self.admit_and_load(request).await;
        if let Err(ref e) = result {
            metrics::counter!("llama_supervisor_admission_rejections_total", "reason" => e.reason())
                .increment(1);
            warn!(error = %e, "Model start rejected");
        }
        result
    }

    async fn admit_and_load(&self, request: StartRequest) -> Result<Value, AdmissionError> {
        request.validate()?;

        let _admission = self.lock.lock().await;

        let service = self.registry.get();
        let state = service.as_ref().map(|s| s.state());
        let model = check_admission(&request.model, state.as_ref(), self.max_concurrent)?;
        let Some(service) = service else {
            return Err(AdmissionError::NotInitialized);
        };

        info!(model = %model.id, template = ?request.template, "Loading model");
        let response = service
            .api()
            .load_model(&model.id, request.template.as_deref())
            .await
            .map_err(|e| AdmissionError::from_client(e, AdmissionError::LoadFailed))?;

        if let Err(e) = service.refresh_models().await {
            warn!(error = %e, "Model list refresh after load failed");
        }
        // The load succeeded, whatever the listing says.
        service.set_model_status(&model.id, "loaded");

        Ok(json!({
            "model": model.id,
            "status": "loaded",
            "response": response,
        }))
    }

    /// Unload a model known to the running server.
    pub async fn stop_model(&self, name: &str) -> Result<Value, AdmissionError> {
        let _admission = self.lock.lock().await;

        let service = self.registry.get().ok_or(AdmissionError::NotInitialized)?;
        let state = service.state();
        if state.status != ServiceStatus::Ready {
            return Err(AdmissionError::NotReady(state.status));
        }
        let model = resolve_model(name, &state.models)?;

        info!(model = %model.id, "Unloading model");
        let response = service
            .api()
            .unload_model(&model.id)
            .await
            .map_err(|e| AdmissionError::from_client(e, AdmissionError::UnloadFailed))?;

        if let Err(e) = service.refresh_models().await {
            warn!(error = %e, "Model list refresh after unload failed");
        }
        service.set_model_status(&model.id, "unloaded");

        Ok(json!({
            "model": model.id,
            "status": "unloaded",
            "response": response,
        }))
    }
}
