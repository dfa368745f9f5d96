//! Connector admin handlers.
//!
//! Implements the per-provider admin surface:
//!
//! - `POST /connectors/{provider}/{meeting_id}/join`
//! - `GET /connectors/{provider}/{meeting_id}/status`
//! - `POST /connectors/{provider}/{meeting_id}/leave`
//! - `POST /connectors/{provider}/{meeting_id}/reconnect`
//! - `POST /connectors/{provider}/{meeting_id}/heartbeat`
//! - `GET /connectors/{provider}/health`
//! - `GET /connectors/{provider}/circuit-breaker`
//! - `POST /connectors/{provider}/circuit-breaker/reset`
//! - `GET /connectors/{provider}/sessions`
//! - `POST /connectors/{provider}/reconcile`
//!
//! Authentication of the admin surface is handled in front of this service.

use crate::errors::ConnectorError;
use crate::models::{
    CircuitBreakerSnapshot, ConnectorHealthResponse, ConnectorSession, ConnectorStatusResponse,
    ListSessionsQuery, ReconciliationRun, ResetRequest, ResetSource, RunSource,
    SessionListResponse,
};
use crate::observability::metrics;
use crate::routes::AppState;
use crate::services::circuit_breaker::DEFAULT_MANUAL_REASON;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use common::types::MeetingId;
use std::sync::Arc;
use tracing::{info, instrument};

/// Default page size for session listing.
pub const DEFAULT_SESSION_LIST_LIMIT: usize = 100;

/// Upper bound on session listing.
pub const MAX_SESSION_LIST_LIMIT: usize = 2000;

/// Error rate over the recent window at which a Closed connector is degraded.
const DEGRADED_ERROR_RATE: f64 = 0.5;

/// Longest accepted manual reset reason (it becomes a metrics label).
const MAX_RESET_REASON_LEN: usize = 64;

fn require_provider(state: &AppState, provider: &str) -> Result<(), ConnectorError> {
    if provider == state.config.provider {
        Ok(())
    } else {
        Err(ConnectorError::NotFound(format!("Unknown connector {provider}")))
    }
}

fn parse_target(
    state: &AppState,
    provider: &str,
    meeting_id: &str,
) -> Result<MeetingId, ConnectorError> {
    require_provider(state, provider)?;
    MeetingId::parse(meeting_id)
        .map_err(|e| ConnectorError::BadRequest(format!("Invalid meeting id: {e}")))
}

// ============================================================================
// Session operations
// ============================================================================

/// Handler for POST /connectors/{provider}/{meeting_id}/join
///
/// # Response
///
/// - 200 OK: session is Connected
/// - 400 Bad Request: malformed meeting id
/// - 404 Not Found: unknown provider
/// - 409 Conflict: operation in progress (`BUSY`) or session already active
/// - 502 Bad Gateway: external API failed, session recorded as Failed
/// - 503 Service Unavailable: circuit breaker is open, session recorded as Failed
#[instrument(skip_all, name = "connector.api.join", fields(provider = %provider, meeting_id = %meeting_id))]
pub async fn join(
    State(state): State<Arc<AppState>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<ConnectorSession>, ConnectorError> {
    let meeting_id = parse_target(&state, &provider, &meeting_id)?;
    let session = state.manager.join(&meeting_id).await?;
    Ok(Json(session))
}

/// Handler for GET /connectors/{provider}/{meeting_id}/status
///
/// Reads without taking the operation lock, so a concurrent operation may
/// not be reflected yet.
#[instrument(skip_all, name = "connector.api.status", fields(provider = %provider, meeting_id = %meeting_id))]
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<ConnectorStatusResponse>, ConnectorError> {
    let meeting_id = parse_target(&state, &provider, &meeting_id)?;
    let response = state.manager.status(&meeting_id).await?;
    Ok(Json(response))
}

/// Handler for POST /connectors/{provider}/{meeting_id}/leave
#[instrument(skip_all, name = "connector.api.leave", fields(provider = %provider, meeting_id = %meeting_id))]
pub async fn leave(
    State(state): State<Arc<AppState>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<ConnectorSession>, ConnectorError> {
    let meeting_id = parse_target(&state, &provider, &meeting_id)?;
    let session = state.manager.leave(&meeting_id).await?;
    Ok(Json(session))
}

/// Handler for POST /connectors/{provider}/{meeting_id}/reconnect
#[instrument(skip_all, name = "connector.api.reconnect", fields(provider = %provider, meeting_id = %meeting_id))]
pub async fn reconnect(
    State(state): State<Arc<AppState>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<ConnectorSession>, ConnectorError> {
    let meeting_id = parse_target(&state, &provider, &meeting_id)?;
    let session = state.manager.reconnect(&meeting_id).await?;
    Ok(Json(session))
}

/// Handler for POST /connectors/{provider}/{meeting_id}/heartbeat
///
/// Called by the live-ingest side while media is flowing.
#[instrument(skip_all, name = "connector.api.heartbeat", fields(provider = %provider, meeting_id = %meeting_id))]
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path((provider, meeting_id)): Path<(String, String)>,
) -> Result<Json<ConnectorSession>, ConnectorError> {
    let meeting_id = parse_target(&state, &provider, &meeting_id)?;
    let session = state.manager.heartbeat(&meeting_id).await?;
    Ok(Json(session))
}

// ============================================================================
// Connector-level endpoints
// ============================================================================

/// Handler for GET /connectors/{provider}/health
///
/// Combines the breaker state, a single-attempt probe of the external API
/// (skipped while the breaker is open) and the recent error rate.
///
/// # Response
///
/// - 200 OK: `healthy` or `degraded`
/// - 503 Service Unavailable: `unhealthy` (breaker open)
#[instrument(skip_all, name = "connector.api.health", fields(provider = %provider))]
pub async fn connector_health(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<(StatusCode, Json<ConnectorHealthResponse>), ConnectorError> {
    require_provider(&state, &provider)?;

    let circuit_breaker = state.manager.breaker_snapshot().await?;
    let probe = state.client.probe_health().await?;
    let (recent_error_rate, recent_calls) = state.client.recent_error_rate();

    let external_api = match probe {
        None => "skipped",
        Some(true) => "reachable",
        Some(false) => "unreachable",
    };
    let status = if circuit_breaker.is_open() {
        "unhealthy"
    } else if probe == Some(false) || recent_error_rate >= DEGRADED_ERROR_RATE {
        "degraded"
    } else {
        "healthy"
    };

    let healthy = status != "unhealthy";
    metrics::set_connector_health(healthy);
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    Ok((
        code,
        Json(ConnectorHealthResponse {
            provider,
            status: status.to_string(),
            circuit_breaker,
            recent_error_rate,
            recent_calls,
            external_api: external_api.to_string(),
        }),
    ))
}

/// Handler for GET /connectors/{provider}/circuit-breaker
#[instrument(skip_all, name = "connector.api.circuit_breaker", fields(provider = %provider))]
pub async fn get_circuit_breaker(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<CircuitBreakerSnapshot>, ConnectorError> {
    require_provider(&state, &provider)?;
    let snapshot = state.manager.breaker_snapshot().await?;
    Ok(Json(snapshot))
}

/// Handler for POST /connectors/{provider}/circuit-breaker/reset
///
/// Body is optional: `{"reason": "..."}`. Resetting a Closed breaker is a
/// no-op that still returns the snapshot.
#[instrument(skip_all, name = "connector.api.circuit_breaker_reset", fields(provider = %provider))]
pub async fn reset_circuit_breaker(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    body: Option<Json<ResetRequest>>,
) -> Result<Json<CircuitBreakerSnapshot>, ConnectorError> {
    require_provider(&state, &provider)?;

    let reason = body
        .and_then(|Json(req)| req.reason)
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| DEFAULT_MANUAL_REASON.to_string());
    if reason.len() > MAX_RESET_REASON_LEN {
        return Err(ConnectorError::BadRequest(format!(
            "Reset reason must be at most {MAX_RESET_REASON_LEN} characters"
        )));
    }

    let reset = state
        .manager
        .breaker()
        .reset(ResetSource::Manual, &reason)
        .await?;
    info!(
        target: "connector.circuit_breaker",
        provider = %provider,
        reason = %reason,
        was_open = reset,
        "Manual circuit breaker reset"
    );

    let snapshot = state.manager.breaker_snapshot().await?;
    Ok(Json(snapshot))
}

/// Handler for GET /connectors/{provider}/sessions?limit=N
///
/// Most recently updated first. `limit` defaults to 100 and is capped at 2000.
#[instrument(skip_all, name = "connector.api.sessions", fields(provider = %provider))]
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<SessionListResponse>, ConnectorError> {
    require_provider(&state, &provider)?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_SESSION_LIST_LIMIT)
        .min(MAX_SESSION_LIST_LIMIT);
    if limit == 0 {
        return Err(ConnectorError::BadRequest(
            "limit must be at least 1".to_string(),
        ));
    }

    let sessions = state.manager.list_sessions(limit).await?;
    Ok(Json(SessionListResponse {
        provider,
        count: sessions.len(),
        sessions,
    }))
}

/// Handler for POST /connectors/{provider}/reconcile
///
/// Runs one reconciliation cycle synchronously and returns its summary.
/// Waits for an in-progress background cycle on this instance to finish.
#[instrument(skip_all, name = "connector.api.reconcile", fields(provider = %provider))]
pub async fn run_reconcile(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
) -> Result<Json<ReconciliationRun>, ConnectorError> {
    require_provider(&state, &provider)?;
    let run = state.reconciler.run_cycle(RunSource::Manual).await?;
    Ok(Json(run))
}
