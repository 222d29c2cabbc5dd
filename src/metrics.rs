/// Metrics and telemetry for the BPN directory
///
/// Provides Prometheus-compatible metrics for monitoring:
/// - HTTP request counts and latencies
/// - Mapping store operation times and outcomes
/// - Cache hit/miss/invalidation rates
/// - Authentication outcomes
/// - Background job execution

use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_histogram_vec, register_int_counter, register_int_counter_vec,
    register_int_gauge, Encoder, Gauge, HistogramVec, IntCounter, IntCounterVec, IntGauge,
    TextEncoder,
};

lazy_static! {
    // ========== HTTP Metrics ==========

    /// Total HTTP requests by method, path, and status
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    )
    .unwrap();

    /// HTTP request duration in seconds
    pub static ref HTTP_REQUEST_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "http_request_duration_seconds",
        "HTTP request latencies in seconds",
        &["method", "path"],
        vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    /// Active HTTP requests
    pub static ref HTTP_REQUESTS_ACTIVE: IntGauge = register_int_gauge!(
        "http_requests_active",
        "Number of HTTP requests currently being processed"
    )
    .unwrap();

    // ========== Store Metrics ==========

    /// Mapping store calls by operation and outcome
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "store_operations_total",
        "Total number of mapping store operations",
        &["operation", "outcome"]
    )
    .unwrap();

    /// Mapping store call duration in seconds
    pub static ref STORE_OPERATION_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "store_operation_duration_seconds",
        "Mapping store latencies in seconds",
        &["operation"],
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0]
    )
    .unwrap();

    /// Retries after transient store failures
    pub static ref STORE_RETRIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "store_retries_total",
        "Total number of retried mapping store operations",
        &["operation"]
    )
    .unwrap();

    /// Lost optimistic-concurrency races
    pub static ref VERSION_CONFLICTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "version_conflicts_total",
        "Total number of version conflicts",
        &["operation"]
    )
    .unwrap();

    /// Store-wide mutation counter as last observed
    pub static ref DIRECTORY_VERSION: IntGauge = register_int_gauge!(
        "directory_version",
        "Last observed directory version"
    )
    .unwrap();

    // ========== Cache Metrics ==========

    pub static ref CACHE_HITS_TOTAL: IntCounter = register_int_counter!(
        "cache_hits_total",
        "Total number of mapping cache hits"
    )
    .unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounter = register_int_counter!(
        "cache_misses_total",
        "Total number of mapping cache misses"
    )
    .unwrap();

    pub static ref CACHE_INVALIDATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cache_invalidations_total",
        "Total number of cache invalidations",
        &["scope"]
    )
    .unwrap();

    pub static ref CACHE_EVICTIONS_TOTAL: IntCounter = register_int_counter!(
        "cache_evictions_total",
        "Total number of capacity evictions"
    )
    .unwrap();

    /// Cache size (number of entries)
    pub static ref CACHE_SIZE: IntGauge = register_int_gauge!(
        "cache_size",
        "Number of entries in the mapping cache"
    )
    .unwrap();

    // ========== Auth Metrics ==========

    /// Authentication attempts by API surface and outcome
    pub static ref AUTH_ATTEMPTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "auth_attempts_total",
        "Total number of authentication attempts",
        &["surface", "outcome"]
    )
    .unwrap();

    // ========== Background Job Metrics ==========

    /// Background job executions
    pub static ref BACKGROUND_JOBS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "background_jobs_total",
        "Total number of background jobs executed",
        &["job_type", "status"]
    )
    .unwrap();

    /// Background job duration in seconds
    pub static ref BACKGROUND_JOB_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "background_job_duration_seconds",
        "Background job execution time in seconds",
        &["job_type"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0]
    )
    .unwrap();

    // ========== Error Metrics ==========

    /// Errors by error code
    pub static ref ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "errors_total",
        "Total number of errors",
        &["error_type", "module"]
    )
    .unwrap();

    // ========== System Metrics ==========

    /// Application uptime in seconds
    pub static ref UPTIME_SECONDS: Gauge = register_gauge!(
        "uptime_seconds",
        "Application uptime in seconds"
    )
    .unwrap();
}

/// Render metrics in Prometheus text format
pub fn render_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record an HTTP request
pub fn record_http_request(method: &str, path: &str, status: u16, duration: f64) {
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method, path, &status.to_string()])
        .inc();
    HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[method, path])
        .observe(duration);
}

/// Record a mapping store call
pub fn record_store_operation(operation: &str, outcome: &str, duration: f64) {
    STORE_OPERATIONS_TOTAL
        .with_label_values(&[operation, outcome])
        .inc();
    STORE_OPERATION_DURATION_SECONDS
        .with_label_values(&[operation])
        .observe(duration);
}

pub fn record_store_retry(operation: &str) {
    STORE_RETRIES_TOTAL.with_label_values(&[operation]).inc();
}

pub fn record_version_conflict(operation: &str) {
    VERSION_CONFLICTS_TOTAL.with_label_values(&[operation]).inc();
}

/// Record a cache access
pub fn record_cache_access(hit: bool) {
    if hit {
        CACHE_HITS_TOTAL.inc();
    } else {
        CACHE_MISSES_TOTAL.inc();
    }
}

pub fn record_cache_invalidation(scope: &str) {
    CACHE_INVALIDATIONS_TOTAL.with_label_values(&[scope]).inc();
}

/// Record an authentication attempt
pub fn record_auth_attempt(surface: &str, success: bool) {
    AUTH_ATTEMPTS_TOTAL
        .with_label_values(&[surface, if success { "success" } else { "failure" }])
        .inc();
}

/// Record a background job execution
pub fn record_background_job(job_type: &str, status: &str, duration: f64) {
    BACKGROUND_JOBS_TOTAL
        .with_label_values(&[job_type, status])
        .inc();
    BACKGROUND_JOB_DURATION_SECONDS
        .with_label_values(&[job_type])
        .observe(duration);
}

/// Record an error
pub fn record_error(error_type: &str, module: &str) {
    ERRORS_TOTAL
        .with_label_values(&[error_type, module])
        .inc();
}
