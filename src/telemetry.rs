//! Prometheus metrics setup and descriptions.
//!
//! Metrics are recorded throughout the codebase using the `metrics` crate's
//! macros. This module installs the Prometheus exporter and registers
//! human-readable descriptions for each metric.

use axum::Router;
use axum::routing::get;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::PrometheusHandle;

/// Install the Prometheus recorder and register metric descriptions.
///
/// Returns `None` if a recorder is already installed (e.g. in tests where
/// multiple `build_app` calls share a process). Metric recording still works;
/// the `metrics` macros route to whichever recorder was installed first.
pub fn install() -> Option<PrometheusHandle> {
    let handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .ok()?;
    describe();
    Some(handle)
}

/// Router serving the Prometheus text format on `/metrics`
pub fn metrics_router(handle: PrometheusHandle) -> Router {
    Router::new().route("/metrics", get(move || async move { handle.render() }))
}

fn describe() {
    // -- llama-server lifecycle --
    describe_counter!(
        "llama_supervisor_starts_total",
        "llama-server start attempts (spawn or attach)"
    );
    describe_counter!(
        "llama_supervisor_crashes_total",
        "Unexpected llama-server exits while ready"
    );
    describe_histogram!(
        "llama_supervisor_startup_duration_seconds",
        "Time from start() to a passing health check"
    );

    // -- Admission --
    describe_counter!(
        "llama_supervisor_admission_rejections_total",
        "Rejected model start/stop requests, by reason"
    );

    // -- Broadcast --
    describe_counter!(
        "llama_supervisor_broadcast_dropped_total",
        "Broadcast messages dropped because the input queue was full"
    );

    // -- Requests --
    describe_gauge!(
        "llama_supervisor_active_sessions",
        "Requests currently being served"
    );

    // -- System sampler --
    describe_gauge!(
        "llama_supervisor_cpu_usage_percent",
        "Global host CPU usage"
    );
    describe_gauge!(
        "llama_supervisor_memory_mb",
        "Resident memory of the supervisor process"
    );
    describe_gauge!(
        "llama_server_memory_mb",
        "Resident memory of the managed llama-server, 0 when not running"
    );
}
