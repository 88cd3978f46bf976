//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with standardized naming conventions for
//! the routing and pipeline stages.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Tandem metrics
pub const METRICS_PREFIX: &str = "tandem";

/// Histogram buckets for pipeline latency (in seconds). Model round trips
/// dominate, so the buckets run well past typical HTTP targets.
pub const PIPELINE_BUCKETS: &[f64] = &[
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
    30.00, // 30s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics
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

    // Classification metrics
    describe_counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        Unit::Count,
        "Total routing classifications by route kind"
    );

    describe_counter!(
        format!("{}_classification_fallbacks_total", METRICS_PREFIX),
        Unit::Count,
        "Classifications that fell back to the narrative-only default"
    );

    // Pipeline metrics
    describe_histogram!(
        format!("{}_pipeline_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Per-pipeline latency in seconds"
    );

    describe_counter!(
        format!("{}_pipeline_failures_total", METRICS_PREFIX),
        Unit::Count,
        "Pipeline runs that returned a failed result"
    );

    // SQL repair metrics
    describe_counter!(
        format!("{}_sql_repairs_total", METRICS_PREFIX),
        Unit::Count,
        "Repair transforms that changed a synthesized query"
    );

    describe_counter!(
        format!("{}_sql_fallback_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Hard-coded fallback queries issued after empty results"
    );

    // Fusion metrics
    describe_counter!(
        format!("{}_fusion_row_appends_total", METRICS_PREFIX),
        Unit::Count,
        "Fused answers that needed rows appended after verification"
    );

    // Database metrics
    describe_gauge!(
        format!("{}_db_connections_active", METRICS_PREFIX),
        Unit::Count,
        "Active database connections"
    );

    // Cache metrics
    describe_counter!(
        format!("{}_cache_hits_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache hits"
    );

    describe_counter!(
        format!("{}_cache_misses_total", METRICS_PREFIX),
        Unit::Count,
        "Total cache misses"
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

/// Helper to record a routing classification
pub fn record_classification(route: &str, from_cache: bool) {
    counter!(
        format!("{}_classifications_total", METRICS_PREFIX),
        "route" => route.to_string(),
        "cached" => from_cache.to_string()
    )
    .increment(1);
}

/// Helper to record a classification default fallback
pub fn record_classification_fallback(reason: &str) {
    counter!(
        format!("{}_classification_fallbacks_total", METRICS_PREFIX),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Helper to record per-pipeline latency and outcome
pub fn record_pipeline(pipeline: &str, duration_secs: f64, succeeded: bool) {
    histogram!(
        format!("{}_pipeline_duration_seconds", METRICS_PREFIX),
        "pipeline" => pipeline.to_string()
    )
    .record(duration_secs);

    if !succeeded {
        counter!(
            format!("{}_pipeline_failures_total", METRICS_PREFIX),
            "pipeline" => pipeline.to_string()
        )
        .increment(1);
    }
}

/// Helper to record an applied SQL repair
pub fn record_sql_repair(transform: &str) {
    counter!(
        format!("{}_sql_repairs_total", METRICS_PREFIX),
        "transform" => transform.to_string()
    )
    .increment(1);
}

/// Helper to record a fallback query issue
pub fn record_sql_fallback() {
    counter!(format!("{}_sql_fallback_queries_total", METRICS_PREFIX)).increment(1);
}

/// Helper to record a post-fusion verbatim row append
pub fn record_fusion_row_append(missing_rows: usize) {
    counter!(format!("{}_fusion_row_appends_total", METRICS_PREFIX)).increment(missing_rows as u64);
}

/// Helper to record database pool activity
pub fn record_db_connections(active: usize) {
    gauge!(format!("{}_db_connections_active", METRICS_PREFIX)).set(active as f64);
}

/// Helper to record cache metrics
pub fn record_cache(hit: bool, cache_name: &str) {
    if hit {
        counter!(
            format!("{}_cache_hits_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    } else {
        counter!(
            format!("{}_cache_misses_total", METRICS_PREFIX),
            "cache" => cache_name.to_string()
        )
        .increment(1);
    }
}
