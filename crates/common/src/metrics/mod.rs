//! Metrics and observability utilities
//!
//! Provides Prometheus metrics with SLO-aligned histograms
//! and standardized naming conventions.

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use std::time::Instant;

/// Metrics prefix for all docpilot metrics
pub const METRICS_PREFIX: &str = "docpilot";

/// SLO-aligned histogram buckets for retrieval latency (in seconds)
/// Targets: P50 < 50ms, P99 < 150ms
pub const LATENCY_BUCKETS: &[f64] = &[
    0.001,  // 1ms
    0.005,  // 5ms
    0.010,  // 10ms
    0.025,  // 25ms
    0.050,  // 50ms - P50 target
    0.075,  // 75ms
    0.100,  // 100ms
    0.150,  // 150ms - P99 target
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.500,  // 2.5s
    5.000,  // 5s
    10.00,  // 10s
];

/// Buckets for embedding and generation calls (typically slower)
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.050,  // 50ms
    0.100,  // 100ms
    0.250,  // 250ms
    0.500,  // 500ms
    1.000,  // 1s
    2.000,  // 2s
    5.000,  // 5s
    10.00,  // 10s
    30.00,  // 30s
    60.00,  // 60s
];

/// Register all metric descriptions
pub fn register_metrics() {
    // Request metrics (REST surface)
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

    // Query lifecycle metrics
    describe_counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        Unit::Count,
        "Total streamed queries, labelled by outcome"
    );

    describe_histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "End-to-end query latency in seconds"
    );

    describe_counter!(
        format!("{}_rate_limited_total", METRICS_PREFIX),
        Unit::Count,
        "Queries rejected by rate limiting, labelled by scope"
    );

    describe_gauge!(
        format!("{}_connections_active", METRICS_PREFIX),
        Unit::Count,
        "Open streaming connections"
    );

    // Retrieval metrics
    describe_histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Retrieval stage latency in seconds"
    );

    describe_gauge!(
        format!("{}_retrieval_items_count", METRICS_PREFIX),
        Unit::Count,
        "Items returned by the retrieval stage"
    );

    // Ingestion metrics
    describe_counter!(
        format!("{}_files_ingested_total", METRICS_PREFIX),
        Unit::Count,
        "Total source files processed"
    );

    describe_counter!(
        format!("{}_chunks_written_total", METRICS_PREFIX),
        Unit::Count,
        "Total chunks upserted into the index"
    );

    describe_counter!(
        format!("{}_chunks_skipped_total", METRICS_PREFIX),
        Unit::Count,
        "Chunks skipped because their content hash was unchanged"
    );

    describe_counter!(
        format!("{}_chunks_deleted_total", METRICS_PREFIX),
        Unit::Count,
        "Stale chunks removed by garbage collection"
    );

    describe_histogram!(
        format!("{}_ingestion_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Full ingestion run latency in seconds"
    );

    // Embedding metrics
    describe_counter!(
        format!("{}_embedding_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API requests"
    );

    describe_histogram!(
        format!("{}_embedding_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Embedding generation latency in seconds"
    );

    describe_counter!(
        format!("{}_embedding_errors_total", METRICS_PREFIX),
        Unit::Count,
        "Total embedding API errors"
    );

    // Generation metrics
    describe_counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        Unit::Count,
        "Total language model requests"
    );

    describe_histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        Unit::Seconds,
        "Language model stream duration in seconds"
    );

    // Session metrics
    describe_gauge!(
        format!("{}_sessions_active", METRICS_PREFIX),
        Unit::Count,
        "Live sessions across all shards"
    );

    describe_counter!(
        format!("{}_sessions_expired_total", METRICS_PREFIX),
        Unit::Count,
        "Sessions removed by expiry sweeps"
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

/// Record a finished streamed query. `outcome` is one of
/// completed/fallback/error/cancelled/timeout.
pub fn record_query(duration_secs: f64, outcome: &str) {
    counter!(
        format!("{}_queries_total", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_query_duration_seconds", METRICS_PREFIX),
        "outcome" => outcome.to_string()
    )
    .record(duration_secs);
}

/// Record a rate-limited rejection; scope is "connection" or "identity"
pub fn record_rate_limited(scope: &str) {
    counter!(
        format!("{}_rate_limited_total", METRICS_PREFIX),
        "scope" => scope.to_string()
    )
    .increment(1);
}

/// Track one streaming connection opening or closing
pub fn record_connection(opened: bool) {
    let gauge = gauge!(format!("{}_connections_active", METRICS_PREFIX));
    if opened {
        gauge.increment(1.0);
    } else {
        gauge.decrement(1.0);
    }
}

/// Helper to record retrieval metrics
pub fn record_retrieval(duration_secs: f64, item_count: usize, relevant: bool) {
    histogram!(
        format!("{}_retrieval_duration_seconds", METRICS_PREFIX),
        "relevant" => relevant.to_string()
    )
    .record(duration_secs);

    gauge!(format!("{}_retrieval_items_count", METRICS_PREFIX)).set(item_count as f64);
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
    } else {
        counter!(
            format!("{}_embedding_errors_total", METRICS_PREFIX),
            "model" => model.to_string()
        )
        .increment(1);
    }
}

/// Helper to record generation metrics
pub fn record_generation(duration_secs: f64, model: &str, success: bool) {
    let status = if success { "success" } else { "error" };

    counter!(
        format!("{}_generation_requests_total", METRICS_PREFIX),
        "model" => model.to_string(),
        "status" => status.to_string()
    )
    .increment(1);

    histogram!(
        format!("{}_generation_duration_seconds", METRICS_PREFIX),
        "model" => model.to_string()
    )
    .record(duration_secs);
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

/// Helper to record an ingestion run
pub fn record_ingestion(
    duration_secs: f64,
    files: usize,
    written: usize,
    skipped: usize,
    deleted: u64,
) {
    counter!(format!("{}_files_ingested_total", METRICS_PREFIX)).increment(files as u64);
    counter!(format!("{}_chunks_written_total", METRICS_PREFIX)).increment(written as u64);
    counter!(format!("{}_chunks_skipped_total", METRICS_PREFIX)).increment(skipped as u64);
    counter!(format!("{}_chunks_deleted_total", METRICS_PREFIX)).increment(deleted);
    histogram!(format!("{}_ingestion_duration_seconds", METRICS_PREFIX)).record(duration_secs);
}

/// Helper to record session store activity
pub fn record_sessions(active: usize, expired_this_sweep: usize) {
    gauge!(format!("{}_sessions_active", METRICS_PREFIX)).set(active as f64);
    if expired_this_sweep > 0 {
        counter!(format!("{}_sessions_expired_total", METRICS_PREFIX))
            .increment(expired_this_sweep as u64);
    }
}
