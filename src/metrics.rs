use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, Encoder, Histogram,
    IntCounter, IntCounterVec, TextEncoder,
};

use crate::error::ErrorCode;
use crate::models::HealthStatus;

lazy_static! {
    // Query metrics
    pub static ref QUERIES_TOTAL: IntCounter = register_int_counter!(
        "datasource_queries_total",
        "Total number of queries dispatched"
    ).unwrap();

    pub static ref QUERY_ERRORS: IntCounterVec = register_int_counter_vec!(
        "datasource_query_errors_total",
        "Queries answered with an error, by error code",
        &["code"]
    ).unwrap();

    pub static ref QUERY_DURATION: Histogram = register_histogram!(
        "datasource_query_duration_seconds",
        "Time from dispatch to result for a single query",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 30.0]
    ).unwrap();

    // Batch metrics
    pub static ref BATCH_ABORTS: IntCounter = register_int_counter!(
        "datasource_batch_aborts_total",
        "Batches failed as a whole after a connection acquisition failure"
    ).unwrap();

    pub static ref BATCH_DURATION: Histogram = register_histogram!(
        "datasource_batch_duration_seconds",
        "Batch duration in seconds",
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 30.0]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECKS: IntCounterVec = register_int_counter_vec!(
        "datasource_health_checks_total",
        "Health checks by resulting status",
        &["status"]
    ).unwrap();
}

pub fn init_metrics() {
    lazy_static::initialize(&QUERIES_TOTAL);
    lazy_static::initialize(&QUERY_ERRORS);
    lazy_static::initialize(&QUERY_DURATION);
    lazy_static::initialize(&BATCH_ABORTS);
    lazy_static::initialize(&BATCH_DURATION);
    lazy_static::initialize(&HEALTH_CHECKS);
}

pub fn record_query() {
    QUERIES_TOTAL.inc();
}

pub fn record_query_error(code: ErrorCode) {
    let label = match code {
        ErrorCode::BadRequest => "bad_request",
        ErrorCode::Internal => "internal",
    };
    QUERY_ERRORS.with_label_values(&[label]).inc();
}

pub fn record_batch_abort() {
    BATCH_ABORTS.inc();
}

pub fn record_health_check(status: HealthStatus) {
    let label = match status {
        HealthStatus::Ok => "ok",
        HealthStatus::Error => "error",
    };
    HEALTH_CHECKS.with_label_values(&[label]).inc();
}

/// Render every registered metric in the Prometheus text format.
pub fn gather_text() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
