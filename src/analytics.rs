//! Process-wide request analytics.
//!
//! One [`Analytics`] instance is built by the composition root and shared
//! through `Arc`. Counters are lock-free; the response-time buffer and the
//! per-minute window sit behind short `std::sync::Mutex` sections.

use crate::broadcast::Envelope;
use futures_util::Stream;
use serde::Serialize;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::time::Instant;
use tracing::{debug, warn};

/// Response-time samples kept for the rolling average
pub const MAX_RESPONSE_SAMPLES: usize = 1000;

/// Length of the requests-per-minute window
const MINUTE: Duration = Duration::from_secs(60);

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Snapshot returned by `GET /api/analytics` and the SSE stream
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsSnapshot {
    pub active_sessions: i64,
    pub requests_per_minute: u64,
    /// Mean of the buffered samples in ms; NaN/inf pass through unfiltered
    pub average_response_time: f64,
    pub total_requests: u64,
    pub error_count: u64,
    pub error_rate: f64,
    /// Seconds since the analytics engine was created
    pub uptime: u64,
    /// Resident memory of this process in MB
    pub bandwidth_usage: f64,
    /// Total size of the log directory in MB
    pub storage_used: f64,
    pub timestamp: i64,
}

struct MinuteWindow {
    count: u64,
    last_reset: Instant,
}

pub struct Analytics {
    active_sessions: AtomicI64,
    total_requests: AtomicU64,
    error_count: AtomicU64,
    minute: Mutex<MinuteWindow>,
    response_times: Mutex<VecDeque<f64>>,
    log_dir: PathBuf,
    created: Instant,
    system: Mutex<System>,
}

impl Analytics {
    pub fn new(log_dir: impl Into<PathBuf>) -> Self {
        let now = Instant::now();
        Self {
            active_sessions: AtomicI64::new(0),
            total_requests: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            minute: Mutex::new(MinuteWindow {
                count: 0,
                last_reset: now,
            }),
            response_times: Mutex::new(VecDeque::with_capacity(MAX_RESPONSE_SAMPLES)),
            log_dir: log_dir.into(),
            created: now,
            system: Mutex::new(System::new()),
        }
    }

    pub fn inc_request(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let now = Instant::now();
        let mut window = self.minute.lock().unwrap_or_else(|p| p.into_inner());
        if now.duration_since(window.last_reset) > MINUTE {
            window.count = 1;
            window.last_reset = now;
        } else {
            window.count += 1;
        }
    }

    /// Unclamped: unbalanced callers can drive the gauge negative.
    pub fn dec_request(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_response_time(&self, ms: f64) {
        let mut samples = self.response_times.lock().unwrap_or_else(|p| p.into_inner());
        if samples.len() == MAX_RESPONSE_SAMPLES {
            samples.pop_front();
        }
        samples.push_back(ms);
    }

    pub fn inc_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn active_sessions(&self) -> i64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Buffered response times, oldest first
    pub fn response_times(&self) -> Vec<f64> {
        self.response_times
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect()
    }

    /// Best-effort snapshot. Filesystem and OS sampling failures degrade to
    /// zero rather than failing.
    pub async fn snapshot(&self) -> AnalyticsSnapshot {
        let total_requests = self.total_requests.load(Ordering::Relaxed);
        let error_count = self.error_count.load(Ordering::Relaxed);

        let average_response_time = {
            let samples = self.response_times.lock().unwrap_or_else(|p| p.into_inner());
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<f64>() / samples.len() as f64
            }
        };

        let error_rate = if total_requests == 0 {
            0.0
        } else {
            error_count as f64 / total_requests as f64
        };

        let requests_per_minute = self
            .minute
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .count;

        AnalyticsSnapshot {
            active_sessions: self.active_sessions(),
            requests_per_minute,
            average_response_time,
            total_requests,
            error_count,
            error_rate,
            uptime: self.created.elapsed().as_secs(),
            bandwidth_usage: self.memory_mb(),
            storage_used: dir_size_mb(&self.log_dir).await,
            timestamp: crate::types::now_millis(),
        }
    }

    fn memory_mb(&self) -> f64 {
        let Ok(pid) = sysinfo::get_current_pid() else {
            return 0.0;
        };
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        system
            .process(pid)
            .map(|p| p.memory() as f64 / BYTES_PER_MB)
            .unwrap_or(0.0)
    }
}

/// Sum of the sizes of the regular files directly inside `dir`, in MB.
/// 0 when the directory cannot be read; unreadable entries are skipped.
pub async fn dir_size_mb(dir: &Path) -> f64 {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "Cannot read log directory");
            return 0.0;
        }
    };

    let mut total: u64 = 0;
    loop {
        match entries.next_entry().await {
            Ok(Some(entry)) => match entry.metadata().await {
                Ok(meta) if meta.is_file() => total += meta.len(),
                Ok(_) => {}
                Err(e) => debug!(path = %entry.path().display(), error = %e, "Skipping entry"),
            },
            Ok(None) => break,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Log directory scan interrupted");
                break;
            }
        }
    }
    total as f64 / BYTES_PER_MB
}

/// Envelope stream for the SSE endpoint: one snapshot immediately, then one
/// per `period`. Ends when the consumer drops it.
pub fn snapshot_stream(
    analytics: Arc<Analytics>,
    period: Duration,
) -> impl Stream<Item = Envelope> {
    async_stream::stream! {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            yield Envelope::new("analytics", analytics.snapshot().await);
        }
    }
}
