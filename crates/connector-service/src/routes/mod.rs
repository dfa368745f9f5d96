//! HTTP routes for the connector service.
//!
//! Defines the Axum router and application state.

use crate::config::Config;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::services::{
    BreakerPolicy, CircuitBreaker, JazzTransport, OperationLock, ResilientJazzClient, RetryPolicy,
    SessionManager,
};
use crate::store::{BreakerStore, LockStore, SessionStore};
use crate::tasks::{ReconciliationConfig, ReconciliationWorker};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,

    /// Durable session store, pinged by `/health`.
    pub sessions: Arc<dyn SessionStore>,

    /// Ephemeral lock store, pinged by `/health`.
    pub locks: Arc<dyn LockStore>,

    pub client: Arc<ResilientJazzClient>,

    pub manager: Arc<SessionManager>,

    pub reconciler: Arc<ReconciliationWorker>,
}

impl AppState {
    /// Wire the connector components over the given stores and transport.
    pub fn new(
        config: Config,
        sessions: Arc<dyn SessionStore>,
        locks: Arc<dyn LockStore>,
        breakers: Arc<dyn BreakerStore>,
        transport: Arc<dyn JazzTransport>,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(
            &config.provider,
            breakers,
            BreakerPolicy::from_config(&config),
        ));
        let client = Arc::new(ResilientJazzClient::new(
            transport,
            breaker,
            RetryPolicy::from_config(&config),
        ));
        let lock = OperationLock::new(&config.provider, Arc::clone(&locks), config.op_lock_ttl());
        let manager = Arc::new(SessionManager::new(
            &config.provider,
            Arc::clone(&sessions),
            lock,
            Arc::clone(&client),
        ));
        let reconciler = Arc::new(ReconciliationWorker::new(
            Arc::clone(&manager),
            Arc::clone(&sessions),
            ReconciliationConfig::from_config(&config),
        ));

        Self {
            config,
            sessions,
            locks,
            client,
            manager,
            reconciler,
        }
    }
}

/// Build the application routes.
pub fn build_routes(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let connector_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/connectors/:provider/health", get(handlers::connector_health))
        .route(
            "/connectors/:provider/circuit-breaker",
            get(handlers::get_circuit_breaker),
        )
        .route(
            "/connectors/:provider/circuit-breaker/reset",
            post(handlers::reset_circuit_breaker),
        )
        .route("/connectors/:provider/sessions", get(handlers::list_sessions))
        .route("/connectors/:provider/reconcile", post(handlers::run_reconcile))
        .route("/connectors/:provider/:meeting_id/join", post(handlers::join))
        .route("/connectors/:provider/:meeting_id/status", get(handlers::status))
        .route("/connectors/:provider/:meeting_id/leave", post(handlers::leave))
        .route(
            "/connectors/:provider/:meeting_id/reconnect",
            post(handlers::reconnect),
        )
        .route(
            "/connectors/:provider/:meeting_id/heartbeat",
            post(handlers::heartbeat),
        )
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer (innermost)
    // 2. TraceLayer
    // 3. http_metrics_middleware (outermost, sees every response)
    connector_routes
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(Duration::from_secs(30)))
        .layer(middleware::from_fn(http_metrics_middleware))
}
