//! Service health handler.
//!
//! `/health` checks that both backing stores answer. It does not call the
//! external meeting API; that is `/connectors/{provider}/health`.

use crate::models::HealthResponse;
use crate::routes::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use std::sync::Arc;

/// Health handler.
///
/// Returns 200 when the session store and the lock store both respond,
/// 503 otherwise. Store errors are logged server-side only.
#[tracing::instrument(skip_all, name = "connector.health")]
pub async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let session_store = match state.sessions.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!(target: "connector.health", error = %e, "Session store ping failed");
            "unhealthy"
        }
    };

    let lock_store = match state.locks.ping().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!(target: "connector.health", error = %e, "Lock store ping failed");
            "unhealthy"
        }
    };

    let ok = session_store == "healthy" && lock_store == "healthy";
    let status = if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if ok { "ok" } else { "unavailable" }.to_string(),
            session_store: session_store.to_string(),
            lock_store: lock_store.to_string(),
        }),
    )
}
