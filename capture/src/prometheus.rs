// prometheus exporter setup

use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request};
use axum::middleware::Next;
use axum::response::IntoResponse;
use metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

pub const EVENTS_RECEIVED_TOTAL: &str = "capture_events_received_total";
pub const EVENTS_DEDUPLICATED_TOTAL: &str = "capture_events_deduplicated_total";
pub const EVENTS_COMMITTED_TOTAL: &str = "capture_events_committed_total";
pub const BATCHES_COMMITTED_TOTAL: &str = "capture_batches_committed_total";
pub const BATCH_SIZE: &str = "capture_commit_batch_size";
pub const COMMIT_DURATION: &str = "capture_commit_duration_seconds";
pub const COMMIT_RETRIES_TOTAL: &str = "capture_commit_retries_total";
pub const COMMIT_FAILURES_TOTAL: &str = "capture_commit_failures_total";
pub const DRAINS_TOTAL: &str = "capture_throttled_drains_total";
pub const ENTRIES_EVICTED_TOTAL: &str = "capture_store_entries_evicted_total";
pub const ENTRIES_EXPIRED_TOTAL: &str = "capture_store_entries_expired_total";
pub const ENTRIES_CORRUPT_TOTAL: &str = "capture_store_entries_corrupt_total";
pub const SWEEPS_TOTAL: &str = "capture_retention_sweeps_total";
pub const CONFIG_PERSIST_FAILURES_TOTAL: &str = "capture_config_persist_failures_total";

pub fn report_received_events(path: &'static str, quantity: u64) {
    counter!(EVENTS_RECEIVED_TOTAL, "path" => path).increment(quantity);
}

pub fn report_duplicate_event() {
    counter!(EVENTS_DEDUPLICATED_TOTAL).increment(1);
}

pub fn report_committed_batch(trigger: &'static str, size: usize, took: Duration) {
    counter!(BATCHES_COMMITTED_TOTAL, "trigger" => trigger).increment(1);
    counter!(EVENTS_COMMITTED_TOTAL).increment(size as u64);
    histogram!(BATCH_SIZE).record(size as f64);
    histogram!(COMMIT_DURATION).record(took.as_secs_f64());
}

pub fn report_commit_retry() {
    counter!(COMMIT_RETRIES_TOTAL).increment(1);
}

pub fn report_commit_failure(trigger: &'static str, size: usize) {
    counter!(COMMIT_FAILURES_TOTAL, "trigger" => trigger).increment(size as u64);
}

pub fn report_drain(size: usize) {
    counter!(DRAINS_TOTAL).increment(1);
    histogram!("capture_drain_batch_size").record(size as f64);
}

pub fn report_evicted_entries(quantity: usize) {
    counter!(ENTRIES_EVICTED_TOTAL).increment(quantity as u64);
}

pub fn report_sweep(expired: usize, corrupt: usize) {
    counter!(SWEEPS_TOTAL).increment(1);
    counter!(ENTRIES_EXPIRED_TOTAL).increment(expired as u64);
    counter!(ENTRIES_CORRUPT_TOTAL, "stage" => "sweep").increment(corrupt as u64);
}

pub fn report_corrupt_listing(quantity: usize) {
    counter!(ENTRIES_CORRUPT_TOTAL, "stage" => "listing").increment(quantity as u64);
}

pub fn report_config_persist_failure() {
    counter!(CONFIG_PERSIST_FAILURES_TOTAL).increment(1);
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request, next: Next) -> impl IntoResponse {
    let start = Instant::now();
    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];
    counter!("http_requests_total", &labels).increment(1);
    histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];
    const BATCH_SIZES: &[f64] = &[
        1.0, 5.0, 10.0, 20.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Suffix("_seconds".to_string()), EXPONENTIAL_SECONDS)?
        .set_buckets_for_metric(Matcher::Suffix("_batch_size".to_string()), BATCH_SIZES)?
        .install_recorder()
}
