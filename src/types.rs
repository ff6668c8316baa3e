//! Shared domain types used across the codebase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of the managed llama-server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    #[default]
    Initial,
    Starting,
    Ready,
    Error,
    Crashed,
    Stopping,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Initial => "initial",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Ready => "ready",
            ServiceStatus::Error => "error",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Stopping => "stopping",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A model known to the managed process (or found on disk)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub name: String,
    /// Size in bytes, 0 when unknown
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub path: String,
    pub modified_at: Option<DateTime<Utc>>,
    /// Load status reported by llama-server (`loaded`, `loading`, `unloaded`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl ModelInfo {
    /// Whether the model currently occupies a slot on the server
    pub fn is_running(&self) -> bool {
        matches!(
            self.status.as_deref(),
            Some("loaded" | "loading" | "running")
        )
    }
}

/// Snapshot of the llama service state.
///
/// Always a copy; mutating it has no effect on the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct LlamaServiceState {
    pub status: ServiceStatus,
    pub models: Vec<ModelInfo>,
    pub last_error: Option<String>,
    pub retries: u32,
    /// Seconds since `started_at`, 0 when not started
    pub uptime: u64,
    pub started_at: Option<DateTime<Utc>>,
}

/// A single log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: String,
    pub source: String,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: &str, source: &str, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level: level.to_string(),
            source: source.to_string(),
            message: message.into(),
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
