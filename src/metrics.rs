//! # Metrics
//!
//! Prometheus instrumentation for the gateway: request outcomes, dispatch
//! latency, queue activity, and per-device GPU gauges. Exposed in text
//! format on `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, GaugeVec, Histogram, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

use crate::gpu_probe::{GpuMetric, SampleState};

lazy_static! {
    /// Synchronous chat requests by terminal outcome kind
    static ref CHAT_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_chat_requests_total",
        "Synchronous chat requests by outcome",
        &["outcome"]
    ).expect("Can't create chat_requests_total metric");

    /// Worker dispatch attempts by model and outcome
    static ref DISPATCH_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_dispatch_attempts_total",
        "Upstream dispatch attempts by model and outcome",
        &["model", "outcome"]
    ).expect("Can't create dispatch_attempts_total metric");

    /// Wall-clock duration of successful upstream dispatches
    static ref DISPATCH_DURATION_SECONDS: Histogram = register_histogram!(
        "gateway_dispatch_duration_seconds",
        "Duration of upstream dispatch calls in seconds"
    ).expect("Can't create dispatch_duration_seconds metric");

    /// Requests that fell back from the external provider to local dispatch
    static ref EXTERNAL_FALLBACKS_TOTAL: IntCounter = register_int_counter!(
        "gateway_external_fallbacks_total",
        "External provider failures absorbed by local fallback"
    ).expect("Can't create external_fallbacks_total metric");

    /// Requests rejected by the sliding-window rate limiter
    static ref RATE_LIMITED_TOTAL: IntCounter = register_int_counter!(
        "gateway_rate_limited_total",
        "Requests rejected by the rate limiter"
    ).expect("Can't create rate_limited_total metric");

    /// Async task submissions accepted into the queue
    static ref TASKS_SUBMITTED_TOTAL: IntCounter = register_int_counter!(
        "gateway_tasks_submitted_total",
        "Async tasks accepted into the queue"
    ).expect("Can't create tasks_submitted_total metric");

    /// Async tasks by terminal status
    static ref TASKS_TERMINAL_TOTAL: IntCounterVec = register_int_counter_vec!(
        "gateway_tasks_terminal_total",
        "Async tasks reaching a terminal status",
        &["status"]
    ).expect("Can't create tasks_terminal_total metric");

    /// Current queue depth (queued plus batching)
    static ref QUEUE_DEPTH: IntGauge = register_int_gauge!(
        "gateway_queue_depth",
        "Tasks currently waiting in the queue"
    ).expect("Can't create queue_depth metric");

    /// Response cache hits
    static ref CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        "gateway_cache_hits_total",
        "Responses served from the content-addressed cache"
    ).expect("Can't create cache_hits_total metric");

    /// Per-device used memory in GB
    static ref GPU_USED_GB: GaugeVec = register_gauge_vec!(
        "gateway_gpu_used_gb",
        "GPU memory in use per device (GB)",
        &["device"]
    ).expect("Can't create gpu_used_gb metric");

    /// Per-device utilization percentage
    static ref GPU_UTILIZATION_PCT: GaugeVec = register_gauge_vec!(
        "gateway_gpu_utilization_pct",
        "GPU utilization per device (percent)",
        &["device"]
    ).expect("Can't create gpu_utilization_pct metric");

    /// Per-device temperature
    static ref GPU_TEMPERATURE_C: GaugeVec = register_gauge_vec!(
        "gateway_gpu_temperature_celsius",
        "GPU temperature per device (degrees C)",
        &["device"]
    ).expect("Can't create gpu_temperature metric");
}

pub fn record_chat_request(outcome: &str) {
    CHAT_REQUESTS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_dispatch(model: &str, success: bool, duration_secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    DISPATCH_ATTEMPTS_TOTAL
        .with_label_values(&[model, outcome])
        .inc();
    if success {
        DISPATCH_DURATION_SECONDS.observe(duration_secs);
    }
}

pub fn record_external_fallback() {
    EXTERNAL_FALLBACKS_TOTAL.inc();
}

pub fn record_rate_limited() {
    RATE_LIMITED_TOTAL.inc();
}

pub fn record_task_submitted() {
    TASKS_SUBMITTED_TOTAL.inc();
}

pub fn record_task_terminal(status: &str) {
    TASKS_TERMINAL_TOTAL.with_label_values(&[status]).inc();
}

pub fn set_queue_depth(depth: usize) {
    QUEUE_DEPTH.set(depth as i64);
}

pub fn record_cache_hit() {
    CACHE_HITS_TOTAL.inc();
}

pub fn record_gpu_sample(metric: &GpuMetric) {
    if metric.state != SampleState::Known {
        return;
    }
    let device = metric.device_id.to_string();
    GPU_USED_GB.with_label_values(&[&device]).set(metric.used_gb);
    GPU_UTILIZATION_PCT
        .with_label_values(&[&device])
        .set(metric.utilization_pct);
    GPU_TEMPERATURE_C
        .with_label_values(&[&device])
        .set(metric.temperature_c);
}

/// Text-format exposition of every registered metric.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
