// ABOUTME: Counters for dispatched events, HTTP requests, cron runs and worker spawns
// ABOUTME: Optional Prometheus exporter served on its own listener

use anyhow::{Context, Result};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Install the global recorder with an HTTP scrape endpoint on `addr`.
/// Must be called from within a tokio runtime.
pub fn install_exporter(addr: &str) -> Result<()> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("Invalid metrics address: {}", addr))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;
    tracing::info!(%addr, "Prometheus exporter listening");
    Ok(())
}

pub fn record_event_dispatched(backend: &'static str, event_type: &str) {
    counter!("luabot_events_dispatched_total", "backend" => backend, "event_type" => event_type.to_string())
        .increment(1);
}

pub fn record_handler_error(backend: &'static str) {
    counter!("luabot_handler_errors_total", "backend" => backend).increment(1);
}

pub fn record_http_request(scheme: &'static str, status: u16) {
    counter!("luabot_http_requests_total", "scheme" => scheme, "status" => status.to_string())
        .increment(1);
}

pub fn record_cron_run(entry: &str, outcome: &'static str) {
    counter!("luabot_cron_runs_total", "entry" => entry.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn record_worker_spawned() {
    counter!("luabot_workers_spawned_total").increment(1);
}

pub fn record_reconnect(backend: &'static str) {
    counter!("luabot_reconnects_total", "backend" => backend).increment(1);
}
