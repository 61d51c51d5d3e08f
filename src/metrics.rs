//! Prometheus metrics

use anyhow::Result;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

/// Setup Prometheus metrics exporter
/// Returns a handle that can be used to render metrics
pub fn setup_metrics() -> Result<metrics_exporter_prometheus::PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// One download attempt of one file
pub fn record_download_attempt(model: &str, file: &str) {
    metrics::counter!("model_keeper_download_attempts_total",
        "model" => model.to_string(),
        "file" => file.to_string()
    )
    .increment(1);
}

pub fn record_download_failure(model: &str, file: &str) {
    metrics::counter!("model_keeper_download_failures_total",
        "model" => model.to_string(),
        "file" => file.to_string()
    )
    .increment(1);
}

pub fn record_bytes_downloaded(model: &str, bytes: u64) {
    metrics::counter!("model_keeper_bytes_downloaded_total",
        "model" => model.to_string()
    )
    .increment(bytes);
}

/// Acquisition gave up after exhausting retries
pub fn record_acquisition_failure(model: &str) {
    metrics::counter!("model_keeper_acquisition_failures_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Record a derived variant and how much it shrank
pub fn record_quantization(model: &str, precision: &str, source_bytes: u64, variant_bytes: u64) {
    metrics::counter!("model_keeper_quantizations_total",
        "model" => model.to_string(),
        "precision" => precision.to_string()
    )
    .increment(1);

    if source_bytes > 0 {
        metrics::gauge!("model_keeper_quantization_size_ratio",
            "model" => model.to_string(),
            "precision" => precision.to_string()
        )
        .set(variant_bytes as f64 / source_bytes as f64);
    }
}

pub fn record_model_loaded(model: &str, elapsed: Duration) {
    metrics::counter!("model_keeper_loads_total",
        "model" => model.to_string()
    )
    .increment(1);
    metrics::histogram!("model_keeper_load_duration_seconds",
        "model" => model.to_string()
    )
    .record(elapsed.as_secs_f64());
}

/// Record a failed load attempt, labelled by error kind
pub fn record_load_failure(model: &str, kind: &str) {
    metrics::counter!("model_keeper_load_failures_total",
        "model" => model.to_string(),
        "kind" => kind.to_string()
    )
    .increment(1);
}

pub fn record_model_unloaded(model: &str) {
    metrics::counter!("model_keeper_unloads_total",
        "model" => model.to_string()
    )
    .increment(1);
}

/// Update loaded model count gauge
pub fn update_loaded_count(count: usize) {
    metrics::gauge!("model_keeper_loaded_models").set(count as f64);
}
