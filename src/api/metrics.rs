//! Prometheus metrics endpoint and recording helpers.
//!
//! This module provides:
//! - A `/metrics` endpoint that renders every engine series in Prometheus format
//! - Middleware for tracking HTTP request counts and durations
//! - `record_*` helpers called by the cache, scheduler, evaluator and pipeline

use axum::{
    body::Body,
    extract::{MatchedPath, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::CoreState;

// Metric names as constants for consistency
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const RULE_EVAL_TOTAL: &str = "n9e_rule_eval_total";
pub const RULE_EVAL_ERRORS_TOTAL: &str = "n9e_rule_eval_errors_total";
pub const QUERY_DURATION_SECONDS: &str = "n9e_query_duration_seconds";
pub const COMPARISON_QUERIES_TOTAL: &str = "n9e_comparison_queries_total";
pub const COMPARISONS_SKIPPED_TOTAL: &str = "n9e_comparisons_skipped_total";
pub const POINTS_REJECTED_RESERVED_CHAR: &str = "points_rejected_reserved_char";
pub const POINTS_REJECTED_TOTAL: &str = "n9e_points_rejected_total";
pub const EVENTS_EMITTED_TOTAL: &str = "n9e_events_emitted_total";
pub const EVENTS_DEDUPED_TOTAL: &str = "n9e_events_deduped_total";
pub const EVENTS_MUTED_TOTAL: &str = "n9e_events_muted_total";
pub const EVENTS_DROPPED_TOTAL: &str = "n9e_events_dropped_total";
pub const EVENTS_PERSIST_RETRIES_TOTAL: &str = "n9e_events_persist_retries_total";
pub const EVENTS_DEAD_LETTERED_TOTAL: &str = "n9e_events_dead_lettered_total";
pub const PIPELINE_FILL_RATIO: &str = "n9e_pipeline_fill_ratio";
pub const CACHE_REFRESH_TOTAL: &str = "n9e_cache_refresh_total";
pub const SCHEDULED_RULES: &str = "n9e_scheduled_rules";

/// Install the Prometheus recorder and return a handle for rendering.
///
/// Call once during startup; a second install fails.
pub fn init_metrics() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus recorder: {}", e))?;

    describe_counter!(HTTP_REQUESTS_TOTAL, "Total number of HTTP requests received");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "HTTP request duration in seconds");
    describe_counter!(RULE_EVAL_TOTAL, "Rule evaluations attempted");
    describe_counter!(RULE_EVAL_ERRORS_TOTAL, "Rule evaluations that failed, by stage");
    describe_histogram!(QUERY_DURATION_SECONDS, "Datasource query latency in seconds");
    describe_counter!(COMPARISON_QUERIES_TOTAL, "Comparison queries issued");
    describe_counter!(COMPARISONS_SKIPPED_TOTAL, "Comparison queries skipped under backpressure");
    describe_counter!(POINTS_REJECTED_RESERVED_CHAR, "Points rejected for reserved characters");
    describe_counter!(POINTS_REJECTED_TOTAL, "Points rejected, by reason");
    describe_counter!(EVENTS_EMITTED_TOTAL, "Events submitted to the pipeline, by state");
    describe_counter!(EVENTS_DEDUPED_TOTAL, "Events dropped as duplicates");
    describe_counter!(EVENTS_MUTED_TOTAL, "Events dropped by mute rules");
    describe_counter!(EVENTS_DROPPED_TOTAL, "Events dropped, by reason");
    describe_counter!(EVENTS_PERSIST_RETRIES_TOTAL, "Event store write retries");
    describe_counter!(EVENTS_DEAD_LETTERED_TOTAL, "Events written to the dead-letter log");
    describe_gauge!(PIPELINE_FILL_RATIO, "Fill ratio of the pipeline ingress buffer");
    describe_counter!(CACHE_REFRESH_TOTAL, "Cache refreshes, by cache and kind (full/skip/error)");
    describe_gauge!(SCHEDULED_RULES, "Rules with a running evaluation task");

    Ok(handle)
}

/// GET /metrics - Returns Prometheus-formatted metrics.
pub async fn metrics_endpoint(State(state): State<Arc<CoreState>>) -> impl IntoResponse {
    gauge!(PIPELINE_FILL_RATIO).set(state.pipeline.fill_ratio());

    match state.metrics_handle.as_ref() {
        Some(h) => (StatusCode::OK, h.render()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Metrics not initialized".to_string(),
        ),
    }
}

/// Middleware to track HTTP request metrics.
pub async fn metrics_middleware(request: Request<Body>, next: Next) -> Response {
    let start = Instant::now();

    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let method = request.method().to_string();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    counter!(HTTP_REQUESTS_TOTAL, "method" => method.clone(), "path" => path.clone(), "status" => status).increment(1);
    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method, "path" => path).record(duration);

    response
}

pub fn record_rule_eval() {
    counter!(RULE_EVAL_TOTAL).increment(1);
}

/// Failed evaluation; `stage` is one of datasource, query, predicate
pub fn record_rule_eval_error(stage: &'static str) {
    counter!(RULE_EVAL_ERRORS_TOTAL, "stage" => stage).increment(1);
}

pub fn record_query_duration(plugin_type: &'static str, elapsed: Duration) {
    histogram!(QUERY_DURATION_SECONDS, "plugin_type" => plugin_type).record(elapsed.as_secs_f64());
}

pub fn record_comparison_query() {
    counter!(COMPARISON_QUERIES_TOTAL).increment(1);
}

pub fn record_comparisons_skipped(count: usize) {
    counter!(COMPARISONS_SKIPPED_TOTAL).increment(count as u64);
}

/// Rejected point. Reserved characters also bump the dedicated counter.
pub fn record_point_rejected(reason: &'static str) {
    counter!(POINTS_REJECTED_TOTAL, "reason" => reason).increment(1);
    if reason == "reserved_char" {
        counter!(POINTS_REJECTED_RESERVED_CHAR).increment(1);
    }
}

pub fn record_event_emitted(state: &'static str) {
    counter!(EVENTS_EMITTED_TOTAL, "state" => state).increment(1);
}

pub fn record_event_deduped() {
    counter!(EVENTS_DEDUPED_TOTAL).increment(1);
}

pub fn record_event_muted() {
    counter!(EVENTS_MUTED_TOTAL).increment(1);
}

/// Dropped event; `reason` is one of full, closed, forward_overflow
pub fn record_event_dropped(reason: &'static str) {
    counter!(EVENTS_DROPPED_TOTAL, "reason" => reason).increment(1);
}

pub fn record_persist_retry() {
    counter!(EVENTS_PERSIST_RETRIES_TOTAL).increment(1);
}

pub fn record_dead_lettered(count: usize) {
    counter!(EVENTS_DEAD_LETTERED_TOTAL).increment(count as u64);
}

/// `kind` is full, skip or error
pub fn record_cache_refresh(cache: &'static str, kind: &'static str) {
    counter!(CACHE_REFRESH_TOTAL, "cache" => cache, "kind" => kind).increment(1);
}

pub fn set_scheduled_rules(count: usize) {
    gauge!(SCHEDULED_RULES).set(count as f64);
}
