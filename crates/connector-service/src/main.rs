//! Meeting Connector Service
//!
//! Admin HTTP surface plus the background reconciliation worker.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Connect to PostgreSQL and run migrations (session store)
//! 4. Connect to Redis (operation locks, circuit breaker)
//! 5. Build the external API transport and application state
//! 6. Spawn the reconciliation worker
//! 7. Serve HTTP until SIGINT/SIGTERM, stop background tasks, then drain

use connector_service::config::Config;
use connector_service::observability::metrics::init_metrics_recorder;
use connector_service::redis::ConnectorRedisClient;
use connector_service::repositories::PgSessionStore;
use connector_service::routes::{self, AppState};
use connector_service::services::HttpJazzTransport;
use connector_service::tasks::start_reconciliation;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Config first: LOG_FORMAT decides the subscriber layout
    let config = Config::from_env().map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "connector_service=debug,tower_http=debug".into());
    if config.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("Starting Meeting Connector Service");
    info!(
        provider = %config.provider,
        bind_address = %config.bind_address,
        api_base = %config.api_base,
        http_retries = config.http_retries,
        cb_failure_threshold = config.cb_failure_threshold,
        reconcile_enabled = config.reconcile_enabled,
        "Configuration loaded successfully"
    );

    // Must happen before any metrics are recorded
    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to initialize metrics recorder");
        e
    })?;

    info!("Connecting to database...");
    let db_url_with_timeout = add_query_timeout(&config.database_url, 5);
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_url_with_timeout)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to connect to database");
            e
        })?;
    sqlx::migrate!("../../migrations")
        .run(&db_pool)
        .await
        .map_err(|e| {
            error!(error = %e, "Failed to run database migrations");
            e
        })?;
    info!("Database connection established");

    info!("Connecting to Redis...");
    let redis = Arc::new(
        ConnectorRedisClient::new(
            &config.redis_url,
            config.redis_connect_timeout(),
            config.redis_command_timeout(),
        )
        .await?,
    );
    info!("Redis connection established");

    let transport = HttpJazzTransport::new(
        &config.api_base,
        config.api_token.clone(),
        config.request_timeout(),
    )?;

    let bind_address = config.bind_address.clone();
    let drain_seconds = config.drain_seconds;
    let reconcile_enabled = config.reconcile_enabled;

    let state = Arc::new(AppState::new(
        config,
        Arc::new(PgSessionStore::new(db_pool)),
        redis.clone(),
        redis,
        Arc::new(transport),
    ));

    let cancel_token = CancellationToken::new();
    let reconcile_handle = if reconcile_enabled {
        let worker = Arc::clone(&state.reconciler);
        let token = cancel_token.child_token();
        Some(tokio::spawn(start_reconciliation(worker, token)))
    } else {
        warn!("Reconciliation worker disabled (SBERJAZZ_RECONCILE_ENABLED=false)");
        None
    };

    let app = routes::build_routes(state, metrics_handle);

    let addr: SocketAddr = bind_address.parse().map_err(|e| {
        error!("Invalid bind address: {}", e);
        e
    })?;
    info!("Meeting Connector Service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_sequence(
            shutdown_signal(),
            cancel_token.clone(),
            drain_seconds,
        ))
        .await?;

    // Already cancelled by the shutdown sequence unless serve failed first
    cancel_token.cancel();
    if let Some(handle) = reconcile_handle {
        if let Err(e) = handle.await {
            warn!(error = %e, "Reconciliation task ended abnormally");
        }
    }

    info!("Meeting Connector Service shutdown complete");

    Ok(())
}

/// Waits for `signal`, stops background tasks so no new reconciliation
/// cycle starts, then holds the listener open for the drain period.
async fn shutdown_sequence<S>(signal: S, background: CancellationToken, drain_secs: u64)
where
    S: Future<Output = ()>,
{
    signal.await;
    background.cancel();

    if drain_secs > 0 {
        warn!("Draining connections for {} seconds...", drain_secs);
        tokio::time::sleep(Duration::from_secs(drain_secs)).await;
        info!("Drain period complete");
    } else {
        info!("Skipping drain period (CONNECTOR_DRAIN_SECONDS=0)");
    }
}

/// Listens for shutdown signals (SIGTERM, SIGINT).
async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received SIGINT, starting graceful shutdown..."),
            Err(e) => error!("Failed to listen for SIGINT: {}", e),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received SIGTERM, starting graceful shutdown...");
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

/// Adds statement_timeout to the database URL.
fn add_query_timeout(url: &str, timeout_secs: u32) -> String {
    let separator = if url.contains('?') { '&' } else { '?' };
    format!(
        "{}{}options=-c%20statement_timeout%3D{}s",
        url, separator, timeout_secs
    )
}
