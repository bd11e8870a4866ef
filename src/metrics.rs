//! Prometheus metrics
//!
//! Recording is a no-op until [`setup_metrics`] installs a recorder, so the
//! library can call these helpers unconditionally.

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record a completed logical request (`outcome` is `success` or an error kind)
pub fn record_request(endpoint: &str, outcome: &'static str) {
    metrics::counter!("model_scout_requests_total",
        "endpoint" => endpoint.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a response served from cache
pub fn record_cache_hit(endpoint: &str) {
    metrics::counter!("model_scout_cache_hits_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a retry
pub fn record_retry(reason: &'static str) {
    metrics::counter!("model_scout_retries_total", "reason" => reason).increment(1);
}

/// Record a circuit opening
pub fn record_circuit_opened(endpoint: &str) {
    metrics::counter!("model_scout_circuit_open_total",
        "endpoint" => endpoint.to_string()
    )
    .increment(1);
}

/// Record a processed batch item
pub fn record_batch_item(success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("model_scout_batch_items_total", "result" => result).increment(1);
}

/// Record a binary download
pub fn record_download(success: bool) {
    let result = if success { "success" } else { "failure" };
    metrics::counter!("model_scout_downloads_total", "result" => result).increment(1);
}

/// Update the known-failed parent model gauge
pub fn update_known_failed_models(count: usize) {
    metrics::gauge!("model_scout_known_failed_models").set(count as f64);
}
