//! Metrics and observability utilities
//!
//! Prometheus metrics for question answering, accessor health and the
//! HTTP surface, all under one naming prefix.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all InvoiceQA metrics
pub const METRICS_PREFIX: &str = "invoiceqa";

/// Histogram buckets for question and request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s, generation backends
];

/// Register all metric descriptions
pub fn register_metrics() {
    // HTTP
    describe_counter!(
        format!("{}_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        format!("{}_request_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    // Engine
    describe_counter!(
        format!("{}_questions_total", METRICS_PREFIX),
        Unit::Count,
        "Questions answered, by strategy"
    );

    describe_histogram!(
        format!("{}_question_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end question latency in seconds"
    );

    describe_counter!(
        format!("{}_accessor_calls_total", METRICS_PREFIX),
        Unit::Count,
        "Accessor calls by accessor and outcome"
    );

    describe_histogram!(
        format!("{}_accessor_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Accessor call latency in seconds"
    );

    describe_histogram!(
        format!("{}_fused_evidence_count", METRICS_PREFIX),
        Unit::Count,
        "Evidence items handed to synthesis"
    );

    describe_counter!(
        format!("{}_grounding_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Generated answers replaced by extractive answers"
    );

    describe_counter!(
        format!("{}_retrieval_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Questions where every accessor failed"
    );

    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Conversation sessions held in memory"
    );

    // Embedding
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding latency in seconds"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            format!("{}_requests_total", METRICS_PREFIX),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            format!("{}_request_duration_seconds", METRICS_PREFIX),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// Record one answered question
pub fn record_question(strategy: &str, duration_secs: f64) {
    counter!(
        format!("{}_questions_total", METRICS_PREFIX),
        "strategy" => strategy.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_question_duration_seconds", METRICS_PREFIX),
        "strategy" => strategy.to_string()
    )
    .record(duration_secs);
}

/// Record one accessor call; `outcome` is ok, error, timeout or malformed
pub fn record_accessor_call(accessor: &str, outcome: &str, duration_secs: f64) {
    counter!(
        format!("{}_accessor_calls_total", METRICS_PREFIX),
        "accessor" => accessor.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_accessor_duration_seconds", METRICS_PREFIX),
        "accessor" => accessor.to_string()
    )
    .record(duration_secs);
}

pub fn record_fused_evidence(count: usize) {
    histogram!(format!("{}_fused_evidence_count", METRICS_PREFIX)).record(count as f64);
}

pub fn record_grounding_fallback() {
    counter!(format!("{}_grounding_fallbacks_total", METRICS_PREFIX)).increment(1);
}

pub fn record_retrieval_failure() {
    counter!(format!("{}_retrieval_failures_total", METRICS_PREFIX)).increment(1);
}

pub fn set_sessions_active(count: usize) {
    gauge!(format!("{}_sessions_active", METRICS_PREFIX)).set(count as f64);
}

/// Helper to record embedding metrics
pub fn record_embedding(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    if success {
        histogram!(
            format!("{}_embedding_duration_seconds", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .record(duration_secs);
    }
}
