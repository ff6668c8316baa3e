//! Periodic system sampler.
//!
//! Every interval, samples host CPU/memory plus the resident memory of this
//! process and of the managed llama-server, then publishes the sample as a
//! `metrics` message and updates the Prometheus gauges.

use crate::broadcast::{Broadcaster, Message};
use crate::service::LlamaService;
use serde::Serialize;
use std::time::Duration;
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemSample {
    /// Global CPU usage in percent
    pub cpu_usage: f32,
    pub memory_used_mb: f64,
    pub memory_total_mb: f64,
    pub supervisor_memory_mb: f64,
    /// `None` when no llama-server process is owned
    pub llama_memory_mb: Option<f64>,
    pub llama_pid: Option<u32>,
}

pub struct SystemMonitor {
    system: System,
}

impl SystemMonitor {
    pub fn new() -> Self {
        let mut system = System::new();
        // CPU usage is a delta; prime the first reading.
        system.refresh_cpu_usage();
        Self { system }
    }

    pub fn sample(&mut self, llama_pid: Option<u32>) -> SystemSample {
        self.system.refresh_cpu_usage();
        self.system.refresh_memory();

        let own = sysinfo::get_current_pid().ok();
        let child = llama_pid.map(Pid::from_u32);
        let pids: Vec<Pid> = own.into_iter().chain(child).collect();
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&pids), true);

        let rss_mb = |pid: Pid| {
            self.system
                .process(pid)
                .map(|p| p.memory() as f64 / BYTES_PER_MB)
        };

        SystemSample {
            cpu_usage: self.system.global_cpu_usage(),
            memory_used_mb: self.system.used_memory() as f64 / BYTES_PER_MB,
            memory_total_mb: self.system.total_memory() as f64 / BYTES_PER_MB,
            supervisor_memory_mb: own.and_then(rss_mb).unwrap_or(0.0),
            llama_memory_mb: child.and_then(rss_mb),
            llama_pid,
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the sampler until `cancel` fires.
pub fn spawn_monitor(
    service: Option<LlamaService>,
    broadcaster: Broadcaster,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut monitor = SystemMonitor::new();
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let pid = service.as_ref().and_then(LlamaService::pid);
            let sample = monitor.sample(pid);

            metrics::gauge!("llama_supervisor_cpu_usage_percent").set(sample.cpu_usage as f64);
            metrics::gauge!("llama_supervisor_memory_mb").set(sample.supervisor_memory_mb);
            metrics::gauge!("llama_server_memory_mb").set(sample.llama_memory_mb.unwrap_or(0.0));

            debug!(
                cpu = sample.cpu_usage,
                memory_mb = sample.memory_used_mb,
                llama_pid = ?sample.llama_pid,
                "System sample"
            );
            match serde_json::to_value(&sample) {
                Ok(value) => broadcaster.publish(Message::Metrics(value)),
                Err(e) => debug!(error = %e, "Failed to encode system sample"),
            }
        }
        debug!("System monitor stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_reports_own_memory() {
        let mut monitor = SystemMonitor::new();
        let sample = monitor.sample(None);
        assert!(sample.memory_total_mb > 0.0);
        assert!(sample.supervisor_memory_mb > 0.0);
        assert!(sample.llama_memory_mb.is_none());
    }

    #[test]
    fn test_sample_serializes_camel_case() {
        let mut monitor = SystemMonitor::new();
        let value = serde_json::to_value(monitor.sample(None)).unwrap();
        assert!(value.get("cpuUsage").is_some());
        assert!(value.get("supervisorMemoryMb").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_publishes_metrics_and_stops() {
        let broadcaster = Broadcaster::new();
        let mut rx = broadcaster.subscribe();
        let cancel = CancellationToken::new();

        let handle = spawn_monitor(
            None,
            broadcaster.clone(),
            Duration::from_secs(30),
            cancel.clone(),
        );
        // First tick fires immediately; let the sample reach the batcher.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        handle.await.unwrap();
        broadcaster.shutdown().await;

        let envelope: serde_json::Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(envelope["type"], "metrics");
        assert!(envelope["data"]["memoryTotalMb"].as_f64().unwrap() > 0.0);
    }
}
