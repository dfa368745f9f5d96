//! Metrics definitions for the connector service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `connector_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded to prevent cardinality explosion:
//! - `method`: 7 values max (GET, POST, PATCH, DELETE, PUT, HEAD, OPTIONS)
//! - `endpoint`: ~12 values (parameterized paths)
//! - `operation`: bounded by code (join, reconnect, leave, health, heartbeat)
//! - `outcome` / `result` / `status`: bounded by code
//! - `state`: 6 session states
//! - `reason`: free-form on manual reset, so callers should keep it short

use crate::models::SessionState;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::collections::HashMap;
use std::time::Duration;

/// Initialize Prometheus metrics recorder and return the handle
/// for serving metrics via HTTP.
///
/// Must be called before any metrics are recorded.
///
/// # Errors
///
/// Returns error if Prometheus recorder fails to install (e.g., already installed).
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("connector_admin_http_request".to_string()),
            &[
                0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000,
            ],
        )
        .map_err(|e| format!("Failed to set admin HTTP request buckets: {e}"))?
        // Outbound attempts are bounded by the per-attempt timeout (10s default)
        .set_buckets_for_metric(
            Matcher::Prefix("connector_http_attempt".to_string()),
            &[
                0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500, 5.000, 10.000, 30.000,
            ],
        )
        .map_err(|e| format!("Failed to set HTTP attempt buckets: {e}"))?
        .set_buckets_for_metric(
            Matcher::Prefix("connector_db_query".to_string()),
            &[
                0.001, 0.002, 0.005, 0.010, 0.020, 0.050, 0.100, 0.250, 0.500, 1.000,
            ],
        )
        .map_err(|e| format!("Failed to set DB query buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))
}

// ============================================================================
// Admin HTTP Metrics
// ============================================================================

/// Record admin HTTP request completion
///
/// Metric: `connector_admin_http_requests_total`, `connector_admin_http_request_duration_seconds`
/// Labels: `method`, `endpoint`, `status`
///
/// Captures framework-level rejections (404, 405, 415, JSON parse errors) as
/// well as handler responses.
pub fn record_http_request(method: &str, endpoint: &str, status_code: u16, duration: Duration) {
    let normalized_endpoint = normalize_endpoint(endpoint);
    let status = categorize_status_code(status_code);

    histogram!("connector_admin_http_request_duration_seconds",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint.clone(),
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("connector_admin_http_requests_total",
        "method" => method.to_string(),
        "endpoint" => normalized_endpoint,
        "status_code" => status_code.to_string()
    )
    .increment(1);
}

fn categorize_status_code(status_code: u16) -> &'static str {
    match status_code {
        200..=299 => "success",
        408 | 504 => "timeout",
        _ => "error",
    }
}

const MEETING_ACTIONS: [&str; 5] = ["join", "status", "leave", "reconnect", "heartbeat"];
const CONNECTOR_ACTIONS: [&str; 4] = ["health", "circuit-breaker", "sessions", "reconcile"];

/// Normalize endpoint path to prevent label cardinality explosion.
///
/// Provider names and meeting ids are replaced with placeholders.
fn normalize_endpoint(path: &str) -> String {
    match path {
        "/health" | "/metrics" => path.to_string(),
        _ => normalize_connector_endpoint(path),
    }
}

fn normalize_connector_endpoint(path: &str) -> String {
    let parts: Vec<&str> = path.split('/').collect();

    if parts.get(1) != Some(&"connectors") {
        return "/other".to_string();
    }

    match parts.as_slice() {
        // /connectors/{provider}/{action}
        ["", _, _, action] if CONNECTOR_ACTIONS.contains(action) => {
            format!("/connectors/{{provider}}/{action}")
        }
        ["", _, _, "circuit-breaker", "reset"] => {
            "/connectors/{provider}/circuit-breaker/reset".to_string()
        }
        // /connectors/{provider}/{meeting_id}/{action}
        ["", _, _, _, action] if MEETING_ACTIONS.contains(action) => {
            format!("/connectors/{{provider}}/{{meeting_id}}/{action}")
        }
        _ => "/other".to_string(),
    }
}

// ============================================================================
// Connector Health Metrics
// ============================================================================

/// Set the connector health gauge.
///
/// Metric: `connector_health` (1 = healthy, 0 = degraded or breaker open)
pub fn set_connector_health(healthy: bool) {
    gauge!("connector_health").set(if healthy { 1.0 } else { 0.0 });
}

/// Set the breaker-open gauge.
///
/// Metric: `connector_circuit_breaker_open` (1 = Open)
pub fn set_circuit_breaker_open(open: bool) {
    gauge!("connector_circuit_breaker_open").set(if open { 1.0 } else { 0.0 });
}

/// Record a breaker reset.
///
/// Metric: `connector_circuit_breaker_resets_total`
/// Labels: `source` (manual, auto), `reason`
pub fn record_breaker_reset(source: &str, reason: &str) {
    counter!("connector_circuit_breaker_resets_total",
        "source" => source.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Refresh the per-state session gauges. States absent from `counts` are
/// set to zero so a drained state does not keep its last value.
///
/// Metric: `connector_sessions`
/// Labels: `state`
pub fn set_session_counts(counts: &HashMap<SessionState, i64>) {
    for state in SessionState::ALL {
        #[allow(clippy::cast_precision_loss)]
        let value = counts.get(&state).copied().unwrap_or(0) as f64;
        gauge!("connector_sessions", "state" => state.as_db_str()).set(value);
    }
}

// ============================================================================
// External API Metrics
// ============================================================================

/// Record a single outbound HTTP attempt.
///
/// Metric: `connector_http_attempts_total`, `connector_http_attempt_duration_seconds`
/// Labels: `operation`, `outcome` (success, retryable, fatal)
pub fn record_http_attempt(operation: &str, outcome: &str, duration: Duration) {
    histogram!("connector_http_attempt_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("connector_http_attempts_total",
        "operation" => operation.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ============================================================================
// Session Operation Metrics
// ============================================================================

/// Record a state machine operation result.
///
/// Metric: `connector_operations_total`
/// Labels: `operation`, `result` (success or the error code)
pub fn record_operation(operation: &str, result: &str) {
    counter!("connector_operations_total",
        "operation" => operation.to_string(),
        "result" => result.to_string()
    )
    .increment(1);
}

/// Record an operation lock acquisition attempt.
///
/// Metric: `connector_lock_acquisitions_total`
/// Labels: `result` (acquired, busy, error)
pub fn record_lock_acquisition(result: &str) {
    counter!("connector_lock_acquisitions_total",
        "result" => result.to_string()
    )
    .increment(1);
}

// ============================================================================
// Reconciliation Metrics
// ============================================================================

/// Record a reconciliation cycle.
///
/// Metric: `connector_reconcile_runs_total`
/// Labels: `source` (job, manual), `status` (success, error)
pub fn record_reconcile_run(source: &str, status: &str) {
    counter!("connector_reconcile_runs_total",
        "source" => source.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Publish the counts of the last completed cycle.
///
/// Metrics: `connector_reconcile_last_stale`, `connector_reconcile_last_failed`,
/// `connector_reconcile_last_reconnected`, `connector_reconcile_last_duration_seconds`
pub fn set_reconcile_last_cycle(stale: u64, failed: u64, reconnected: u64, duration: Duration) {
    #[allow(clippy::cast_precision_loss)]
    {
        gauge!("connector_reconcile_last_stale").set(stale as f64);
        gauge!("connector_reconcile_last_failed").set(failed as f64);
        gauge!("connector_reconcile_last_reconnected").set(reconnected as f64);
    }
    gauge!("connector_reconcile_last_duration_seconds").set(duration.as_secs_f64());
}

// ============================================================================
// Database Metrics
// ============================================================================

/// Record database query execution.
///
/// Metric: `connector_db_query_duration_seconds`, `connector_db_queries_total`
/// Labels: `operation`, `status`
pub fn record_db_query(operation: &str, status: &str, duration: Duration) {
    histogram!("connector_db_query_duration_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());

    counter!("connector_db_queries_total",
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}
