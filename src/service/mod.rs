//! Llama service - owns the llama-server process and its state machine
//!
//! ```text
//!   initial ──start──▶ starting ──healthy──▶ ready ──stop──▶ stopping ──exit──▶ initial
//!                         │                    │
//!                         ▼                    ▼ (unexpected exit)
//!                       error ◀──┐          crashed
//!                         │      │             │
//!                         └──────┴──start──────┘
//! ```
//!
//! The service is responsible for:
//! - Spawning llama-server (or attaching to one already listening)
//! - Polling `/health` until ready, with a hard startup deadline
//! - Detecting crashes, and terminating the process on `stop()`
//! - Publishing every state change to registered listeners
//!
//! It never restarts itself; see [`spawn_supervisor`] for that.

mod process;
mod supervisor;

pub use supervisor::{RestartPolicy, spawn_supervisor};

use crate::client::{LlamaApi, LlamaClient};
use crate::config::LlamaServerConfig;
use crate::logs::LogBuffer;
use crate::types::{LlamaServiceState, ModelInfo, ServiceStatus};
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Grace period between SIGTERM and SIGKILL in [`LlamaService::stop`]
pub const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Callback invoked with a snapshot after every state change
pub type StateListener = Box<dyn Fn(&LlamaServiceState) + Send + Sync>;

/// Errors from the llama service
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("failed to spawn llama-server: {0}")]
    SpawnFailed(String),

    #[error("llama-server did not become healthy within {0:?}")]
    StartupTimeout(Duration),

    #[error("llama-server exited during startup ({0})")]
    ExitedDuringStartup(String),

    #[error("llama-server did not exit after SIGKILL (pid {0})")]
    StopFailed(u32),

    #[error("llama-server is stopping")]
    Stopping,

    #[error("Llama server is not ready (status: {0})")]
    NotReady(ServiceStatus),

    #[error("llama-server was started outside the supervisor and cannot be restarted")]
    NotOwned,
}

/// Result of a successful launch
struct Launched {
    /// Set when we spawned the process rather than attaching
    spawned: Option<(u32, watch::Receiver<Option<String>>)>,
    models: Vec<ModelInfo>,
}

/// The one OS process owned by the service
struct ProcessHandle {
    pid: u32,
    /// Set to the exit description once the process has been reaped
    exited: watch::Receiver<Option<String>>,
}

struct ServiceState {
    status: ServiceStatus,
    models: Vec<ModelInfo>,
    last_error: Option<String>,
    retries: u32,
    started_at: Option<DateTime<Utc>>,
    process: Option<ProcessHandle>,
}

impl ServiceState {
    fn snapshot(&self) -> LlamaServiceState {
        let uptime = self
            .started_at
            .map(|t| (Utc::now() - t).num_seconds().max(0) as u64)
            .unwrap_or(0);
        LlamaServiceState {
            status: self.status,
            models: self.models.clone(),
            last_error: self.last_error.clone(),
            retries: self.retries,
            uptime,
            started_at: self.started_at,
        }
    }
}

struct ServiceInner {
    config: LlamaServerConfig,
    api: Arc<dyn LlamaApi>,
    state: Mutex<ServiceState>,
    listeners: RwLock<Vec<StateListener>>,
    logs: Option<Arc<LogBuffer>>,
}

/// Supervises a single llama-server process. Cheap to clone.
pub struct LlamaService {
    inner: Arc<ServiceInner>,
}

impl Clone for LlamaService {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl LlamaService {
    /// Create a service talking to llama-server over HTTP
    pub fn new(config: LlamaServerConfig, logs: Option<Arc<LogBuffer>>) -> Self {
        let client = LlamaClient::new(config.base_url(), config.base_path.clone())
            .with_health_timeout(config.health_timeout());
        Self::with_api(config, Arc::new(client), logs)
    }

    /// Create a service with a custom API implementation
    pub fn with_api(
        config: LlamaServerConfig,
        api: Arc<dyn LlamaApi>,
        logs: Option<Arc<LogBuffer>>,
    ) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                config,
                api,
                state: Mutex::new(ServiceState {
                    status: ServiceStatus::Initial,
                    models: Vec::new(),
                    last_error: None,
                    retries: 0,
                    started_at: None,
                    process: None,
                }),
                listeners: RwLock::new(Vec::new()),
                logs,
            }),
        }
    }

    pub fn config(&self) -> &LlamaServerConfig {
        &self.inner.config
    }

    pub fn api(&self) -> Arc<dyn LlamaApi> {
        Arc::clone(&self.inner.api)
    }

    /// A copy of the current state
    pub fn state(&self) -> LlamaServiceState {
        self.lock_state().snapshot()
    }

    pub fn status(&self) -> ServiceStatus {
        self.lock_state().status
    }

    /// PID of the owned llama-server process, if any
    pub fn pid(&self) -> Option<u32> {
        self.lock_state().process.as_ref().map(|p| p.pid)
    }

    /// Register a listener for state changes.
    ///
    /// Listeners run synchronously on the thread making the change, in
    /// registration order. They may read the service state but must not
    /// register further listeners.
    pub fn on_state_change<F>(&self, listener: F)
    where
        F: Fn(&LlamaServiceState) + Send + Sync + 'static,
    {
        match self.inner.listeners.write() {
            Ok(mut listeners) => listeners.push(Box::new(listener)),
            Err(_) => error!("Listener registry poisoned; listener dropped"),
        }
    }

    /// Start llama-server and wait until it is ready.
    ///
    /// Returns immediately if the service is already `starting` or `ready`.
    /// Failures leave the service in `error` with `last_error` set.
    pub async fn start(&self) -> Result<(), ServiceError> {
        // Check-and-set before the first await so overlapping calls never
        // both spawn.
        let changed = self.update(|state| match state.status {
            ServiceStatus::Ready | ServiceStatus::Starting => Ok(false),
            ServiceStatus::Stopping => Err(ServiceError::Stopping),
            ServiceStatus::Error | ServiceStatus::Crashed => {
                state.retries += 1;
                state.status = ServiceStatus::Starting;
                Ok(true)
            }
            ServiceStatus::Initial => {
                state.status = ServiceStatus::Starting;
                Ok(true)
            }
        })?;
        if !changed {
            debug!("llama-server already starting or ready");
            return Ok(());
        }

        metrics::counter!("llama_supervisor_starts_total").increment(1);
        self.log_info("Starting llama-server");
        let started = Instant::now();

        match self.launch().await {
            Ok(Launched { spawned, models }) => {
                let count = models.len();
                let mut lost: Option<ServiceError> = None;
                let applied = self.update(|state| {
                    if state.status != ServiceStatus::Starting {
                        return Ok::<_, ServiceError>(false);
                    }
                    // The child may exit between the health check and here.
                    if let Some((pid, ref exited)) = spawned
                        && state.process.as_ref().map(|p| p.pid) != Some(pid)
                    {
                        let status = exited
                            .borrow()
                            .clone()
                            .unwrap_or_else(|| "exited before ready".to_string());
                        let e = ServiceError::ExitedDuringStartup(status);
                        state.status = ServiceStatus::Error;
                        state.last_error = Some(e.to_string());
                        state.models.clear();
                        lost = Some(e);
                        return Ok(true);
                    }
                    state.status = ServiceStatus::Ready;
                    state.models = models;
                    state.last_error = None;
                    state.retries = 0;
                    state.started_at = Some(Utc::now());
                    Ok(true)
                })?;
                if let Some(e) = lost {
                    error!(error = %e, "llama-server exited before it became ready");
                    self.log_error(e.to_string());
                    return Err(e);
                }
                if applied {
                    metrics::histogram!("llama_supervisor_startup_duration_seconds")
                        .record(started.elapsed().as_secs_f64());
                    info!(
                        models = count,
                        elapsed_ms = started.elapsed().as_millis(),
                        "llama-server is ready"
                    );
                    self.log_info(format!("llama-server is ready ({count} models)"));
                }
                Ok(())
            }
            Err(e) => {
                error!(error = %e, "Failed to start llama-server");
                self.log_error(e.to_string());
                let message = e.to_string();
                self.update(move |state| {
                    if state.status != ServiceStatus::Starting {
                        return Ok::<_, ServiceError>(false);
                    }
                    state.status = ServiceStatus::Error;
                    state.last_error = Some(message);
                    Ok(true)
                })?;
                Err(e)
            }
        }
    }

    /// Terminate the owned process: SIGTERM, then SIGKILL after the stop
    /// timeout. No-op when no process is owned.
    pub async fn stop(&self) -> Result<(), ServiceError> {
        let handle = {
            let mut state = self.lock_state();
            let Some(ref process) = state.process else {
                debug!("No llama-server process to stop");
                return Ok(());
            };
            let handle = (process.pid, process.exited.clone());
            state.status = ServiceStatus::Stopping;
            let snapshot = state.snapshot();
            drop(state);
            self.notify(&snapshot);
            handle
        };
        let (pid, mut exited) = handle;

        info!(pid, "Stopping llama-server");
        self.log_info(format!("Stopping llama-server (pid {pid})"));
        self.terminate(pid, &mut exited).await?;

        self.update(|state| {
            if state.process.as_ref().is_some_and(|p| p.pid == pid) {
                state.process = None;
            }
            if state.status != ServiceStatus::Stopping {
                return Ok::<_, ServiceError>(false);
            }
            state.status = ServiceStatus::Initial;
            state.models.clear();
            state.started_at = None;
            Ok(true)
        })?;
        info!(pid, "llama-server stopped");
        Ok(())
    }

    /// Stop, then start again.
    ///
    /// Only a process spawned by this service can be restarted; an attached
    /// external server yields [`ServiceError::NotOwned`].
    pub async fn restart(&self) -> Result<(), ServiceError> {
        {
            let state = self.lock_state();
            if state.status == ServiceStatus::Ready && state.process.is_none() {
                return Err(ServiceError::NotOwned);
            }
        }
        self.stop().await?;
        self.start().await
    }

    /// Re-query the model list from the running server
    pub async fn refresh_models(&self) -> Result<Vec<ModelInfo>, ServiceError> {
        let status = self.status();
        if status != ServiceStatus::Ready {
            return Err(ServiceError::NotReady(status));
        }

        let mut models = self.inner.api.load_models().await;
        self.update(|state| {
            if state.status != ServiceStatus::Ready {
                return Ok::<_, ServiceError>(false);
            }
            // A listing without status (the directory fallback) keeps what we knew.
            for model in models.iter_mut().filter(|m| m.status.is_none()) {
                model.status = state
                    .models
                    .iter()
                    .find(|known| known.id == model.id)
                    .and_then(|known| known.status.clone());
            }
            state.models = models.clone();
            Ok(true)
        })?;
        debug!(count = models.len(), "Model list refreshed");
        Ok(models)
    }

    /// Record a model's load status after a load or unload went through.
    ///
    /// Returns false when the service is not ready or the model is unknown.
    pub fn set_model_status(&self, id: &str, status: &str) -> bool {
        self.update(|state| {
            if state.status != ServiceStatus::Ready {
                return Ok::<_, ServiceError>(false);
            }
            let Some(model) = state.models.iter_mut().find(|m| m.id == id) else {
                return Ok(false);
            };
            if model.status.as_deref() == Some(status) {
                return Ok(false);
            }
            model.status = Some(status.to_string());
            Ok(true)
        })
        .unwrap_or(false)
    }

    // -----------------------------------------------------------------------
    // Private
    // -----------------------------------------------------------------------

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply `f` under the state lock and notify listeners if it reports a change.
    fn update<F, E>(&self, f: F) -> Result<bool, E>
    where
        F: FnOnce(&mut ServiceState) -> Result<bool, E>,
    {
        let snapshot = {
            let mut state = self.lock_state();
            if !f(&mut state)? {
                return Ok(false);
            }
            state.snapshot()
        };
        self.notify(&snapshot);
        Ok(true)
    }

    fn notify(&self, snapshot: &LlamaServiceState) {
        let Ok(listeners) = self.inner.listeners.read() else {
            error!("Listener registry poisoned; state change not delivered");
            return;
        };
        for listener in listeners.iter() {
            listener(snapshot);
        }
    }

    /// Attach to a healthy server, or spawn one and wait for it.
    async fn launch(&self) -> Result<Launched, ServiceError> {
        let api = &self.inner.api;

        if api.health_check().await {
            info!(
                port = self.inner.config.port,
                "llama-server already listening, attaching without spawning"
            );
            return Ok(Launched {
                spawned: None,
                models: api.load_models().await,
            });
        }

        let (pid, exited) = self.spawn_process()?;
        self.wait_until_healthy(pid, exited.clone()).await?;
        Ok(Launched {
            spawned: Some((pid, exited)),
            models: api.load_models().await,
        })
    }

    /// Called by the exit watcher once the child has been reaped
    fn handle_exit(&self, pid: u32, description: &str) {
        let _ = self.update(|state| {
            if state.process.as_ref().map(|p| p.pid) != Some(pid) {
                return Ok::<_, ServiceError>(false);
            }
            state.process = None;
            match state.status {
                ServiceStatus::Ready => {
                    let message = format!("llama-server exited unexpectedly ({description})");
                    warn!(pid, status = %description, "llama-server exited unexpectedly");
                    metrics::counter!("llama_supervisor_crashes_total").increment(1);
                    self.log_error(message.clone());
                    state.status = ServiceStatus::Crashed;
                    state.last_error = Some(message);
                    state.models.clear();
                    state.started_at = None;
                    Ok(true)
                }
                ServiceStatus::Stopping => {
                    state.status = ServiceStatus::Initial;
                    state.models.clear();
                    state.started_at = None;
                    Ok(true)
                }
                other => {
                    // Startup failures are reported by start() itself
                    debug!(pid, status = %other, exit = %description, "llama-server exited");
                    Ok(false)
                }
            }
        });
    }

    fn log_info(&self, message: impl Into<String>) {
        if let Some(ref logs) = self.inner.logs {
            logs.info("supervisor", message);
        }
    }

    fn log_error(&self, message: impl Into<String>) {
        if let Some(ref logs) = self.inner.logs {
            logs.error("supervisor", message);
        }
    }
}
