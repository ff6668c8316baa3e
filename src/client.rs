//! HTTP client for the managed llama-server.
//!
//! The client never touches service state: it only answers questions
//! (is the server healthy, which models does it know) and forwards
//! load/unload requests.

use crate::types::ModelInfo;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Model file extension picked up by the directory scan
const MODEL_EXTENSION: &str = "gguf";

/// Longest upstream error body kept in an error message
const MAX_ERROR_BODY: usize = 2000;

/// Errors talking to llama-server
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to llama-server: {0}")]
    Connect(String),

    #[error("llama-server returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("invalid response from llama-server: {0}")]
    Decode(String),
}

/// Operations the service and admission guard need from llama-server.
#[async_trait]
pub trait LlamaApi: Send + Sync {
    /// `true` only when `/health` answers 200. Never fails.
    async fn health_check(&self) -> bool;

    /// Model inventory, falling back to a directory scan. Never fails.
    async fn load_models(&self) -> Vec<ModelInfo>;

    /// Ask the server to load a model, returning the upstream JSON body.
    async fn load_model(&self, model: &str, template: Option<&str>)
    -> Result<Value, ClientError>;

    /// Ask the server to unload a model.
    async fn unload_model(&self, model: &str) -> Result<Value, ClientError>;
}

/// reqwest-backed [`LlamaApi`]
#[derive(Debug, Clone)]
pub struct LlamaClient {
    client: reqwest::Client,
    base_url: String,
    base_path: Option<PathBuf>,
    health_timeout: Duration,
    request_timeout: Duration,
}

impl LlamaClient {
    pub fn new(base_url: impl Into<String>, base_path: Option<PathBuf>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            base_path,
            health_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(300),
        }
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    async fn fetch_model_list(&self) -> Result<Vec<ModelInfo>, ClientError> {
        let url = format!("{}/models", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
                body: read_body(response).await,
            });
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;

        parse_model_list(&body)
            .ok_or_else(|| ClientError::Decode("expected a model array or {data: [...]}".into()))
    }

    async fn post_json(&self, path: &str, body: Value) -> Result<Value, ClientError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .timeout(self.request_timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| ClientError::Connect(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: read_body(response).await,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).or(Ok(Value::String(text)))
    }
}

#[async_trait]
impl LlamaApi for LlamaClient {
    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                debug!(url = %url, error = %e, "Health check failed");
                false
            }
        }
    }

    async fn load_models(&self) -> Vec<ModelInfo> {
        match self.fetch_model_list().await {
            Ok(models) => return models,
            Err(e) => debug!(error = %e, "Model listing failed, falling back to directory scan"),
        }

        match &self.base_path {
            Some(dir) => scan_model_dir(dir).await,
            None => Vec::new(),
        }
    }

    async fn load_model(
        &self,
        model: &str,
        template: Option<&str>,
    ) -> Result<Value, ClientError> {
        let mut body = json!({ "model": model });
        if let Some(template) = template {
            body["template"] = Value::String(template.to_string());
        }
        self.post_json("/models/load", body).await
    }

    async fn unload_model(&self, model: &str) -> Result<Value, ClientError> {
        self.post_json("/models/unload", json!({ "model": model }))
            .await
    }
}

async fn read_body(response: reqwest::Response) -> String {
    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => format!("(failed to read body: {e})"),
    };
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...[truncated, {} total]", &body[..end], body.len())
    } else {
        body
    }
}

/// Parse a model listing, accepting `{data: [...]}` or a bare array.
///
/// Entries without an id are skipped; duplicate ids keep the first entry.
pub fn parse_model_list(body: &Value) -> Option<Vec<ModelInfo>> {
    let items = match body {
        Value::Array(items) => items,
        Value::Object(map) => map.get("data")?.as_array()?,
        _ => return None,
    };

    let mut seen = HashSet::new();
    Some(
        items
            .iter()
            .filter_map(parse_model_entry)
            .filter(|m| seen.insert(m.id.clone()))
            .collect(),
    )
}

fn parse_model_entry(item: &Value) -> Option<ModelInfo> {
    let id = item
        .get("id")
        .or_else(|| item.get("model"))
        .or_else(|| item.get("name"))?
        .as_str()?
        .to_string();

    let name = item
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or(&id)
        .to_string();

    let size = item
        .get("size")
        .and_then(Value::as_u64)
        .or_else(|| item.pointer("/meta/size").and_then(Value::as_u64))
        .unwrap_or(0);

    let kind = item
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or(MODEL_EXTENSION)
        .to_string();

    let path = item
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let modified_at = item
        .get("modified_at")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|| {
            item.get("created")
                .and_then(Value::as_i64)
                .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        });

    // llama-server reports either "status": "loaded" or "status": {"value": "loaded"}
    let status = item.get("status").and_then(|s| match s {
        Value::String(s) => Some(s.clone()),
        Value::Object(_) => s.get("value").and_then(Value::as_str).map(String::from),
        _ => None,
    });

    Some(ModelInfo {
        id,
        name,
        size,
        kind,
        path,
        modified_at,
        status,
    })
}

/// Find model files under `dir`, sorted by id.
///
/// Unreadable entries are skipped; a missing directory yields no models.
pub async fn scan_model_dir(dir: &Path) -> Vec<ModelInfo> {
    let mut models = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %current.display(), error = %e, "Failed to read models directory");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                pending.push(path);
                continue;
            }
            let is_model = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(MODEL_EXTENSION));
            if !is_model {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            models.push(ModelInfo {
                id: stem.to_string(),
                name: stem.to_string(),
                size: metadata.len(),
                kind: MODEL_EXTENSION.to_string(),
                path: path.display().to_string(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                status: None,
            });
        }
    }

    models.sort_by(|a, b| a.id.cmp(&b.id));
    models.dedup_by(|a, b| a.id == b.id);
    models
}
