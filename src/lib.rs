//! # llama-supervisor
//!
//! Lifecycle supervisor for a local llama-server process.
//!
//! This crate provides:
//! - **Service**: spawns (or attaches to) llama-server and tracks its state
//! - **Admission**: gates model loads behind a concurrency ceiling
//! - **Analytics**: process-wide request counters, streamed over SSE
//! - **Broadcast**: debounced/batched fan-out of state changes to WebSocket clients
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     llama-supervisor                        │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ API routes + request tracking layer                  │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │           │                         │                       │
//! │  ┌────────────────────┐   ┌──────────────────────┐         │
//! │  │ Admission Guard    │   │ Analytics            │         │
//! │  └────────────────────┘   └──────────────────────┘         │
//! │           │                                                 │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ LlamaService                                         │   │
//! │  │ - initial | starting | ready | error | crashed | ... │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │           │ state changes, logs, system samples            │
//! │  ┌─────────────────────────────────────────────────────┐   │
//! │  │ Broadcaster ──▶ WebSocket clients                    │   │
//! │  └─────────────────────────────────────────────────────┘   │
//! │           │                                                 │
//! │           ▼                                                 │
//! │     [llama-server:8080]                                     │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod admission;
pub mod analytics;
pub mod args;
pub mod broadcast;
pub mod client;
mod config;
pub mod logs;
mod middleware;
pub mod monitor;
pub mod routes;
pub mod service;
pub mod telemetry;
pub mod types;

pub use admission::{AdmissionError, AdmissionGuard, ServiceRegistry, StartRequest};
pub use analytics::{Analytics, AnalyticsSnapshot};
pub use broadcast::{Broadcaster, Envelope, Message};
pub use client::{ClientError, LlamaApi, LlamaClient};
pub use config::{Config, FlashAttn, LlamaServerConfig, RestartConfig};
pub use middleware::{RequestTrackingLayer, RequestTrackingService};
pub use routes::AppState;
pub use service::{LlamaService, RestartPolicy, STOP_TIMEOUT, ServiceError};
pub use types::{LlamaServiceState, LogEntry, ModelInfo, ServiceStatus};

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// The assembled application: routers plus the handles needed to shut down.
#[derive(Clone)]
pub struct App {
    /// API router (with request tracking)
    pub router: axum::Router,
    /// Prometheus router, when `metrics_port > 0`
    pub metrics_router: Option<axum::Router>,
    pub state: AppState,
    pub service: LlamaService,
    background: CancellationToken,
}

impl App {
    /// Stop background tasks and llama-server, then flush pending broadcasts.
    ///
    /// Closing the broadcaster also ends open WebSocket and SSE streams.
    /// Safe to call more than once.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down");
        self.background.cancel();
        let stopped = self.service.stop().await;
        self.state.broadcaster.shutdown().await;
        stopped?;
        Ok(())
    }
}

/// Build the complete supervisor stack. Must be called inside a Tokio runtime.
///
/// Does not start llama-server; call `app.service.start()` for that.
pub fn build_app(config: Config) -> Result<App> {
    anyhow::ensure!(
        config.max_concurrent_models > 0,
        "max_concurrent_models must be at least 1"
    );

    info!(
        binary = %config.llama.server_path,
        llama_port = config.llama.port,
        max_concurrent_models = config.max_concurrent_models,
        "Building llama-supervisor"
    );

    let broadcaster = Broadcaster::new();
    let logs = Arc::new(logs::LogBuffer::new(
        config.log_capacity,
        Some(broadcaster.clone()),
    ));

    let service = LlamaService::new(config.llama.clone(), Some(logs.clone()));
    {
        let broadcaster = broadcaster.clone();
        service.on_state_change(move |state| {
            broadcaster.publish(Message::LlamaStatus(state.clone()));
        });
    }

    let registry = ServiceRegistry::new();
    registry.register(service.clone());
    let admission = AdmissionGuard::new(registry.clone(), config.max_concurrent_models);
    let analytics = Arc::new(Analytics::new(config.log_dir.clone()));

    let background = CancellationToken::new();

    if config.auto_restart.enabled {
        let _supervisor = service::spawn_supervisor(
            service.clone(),
            RestartPolicy::from(&config.auto_restart),
            background.child_token(),
        );
    }

    if config.metrics_interval_secs > 0 {
        let _monitor = monitor::spawn_monitor(
            Some(service.clone()),
            broadcaster.clone(),
            Duration::from_secs(config.metrics_interval_secs),
            background.child_token(),
        );
    }

    let state = AppState {
        registry,
        admission,
        analytics: analytics.clone(),
        broadcaster,
        logs,
        analytics_interval: Duration::from_secs(config.analytics_interval_secs.max(1)),
    };

    let router = routes::api_router(state.clone()).layer(RequestTrackingLayer::new(analytics));

    let metrics_router = if config.metrics_port > 0 {
        match telemetry::install() {
            Some(handle) => Some(telemetry::metrics_router(handle)),
            None => {
                warn!("Metrics recorder already installed, not serving /metrics");
                None
            }
        }
    } else {
        None
    };

    Ok(App {
        router,
        metrics_router,
        state,
        service,
        background,
    })
}
