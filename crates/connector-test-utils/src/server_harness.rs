//! Test server harness for end-to-end tests.
//!
//! Provides `TestConnectorServer` for spawning the real connector router in
//! tests. Sessions, locks and breaker state live in one shared
//! [`MemoryStore`] that tests can inspect and seed directly.

use connector_service::config::Config;
use connector_service::routes::{self, AppState};
use connector_service::services::jazz_client::mock::MockJazzTransport;
use connector_service::services::JazzTransport;
use connector_service::store::memory::MemoryStore;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Provider name the test server accepts.
pub const TEST_PROVIDER: &str = "sberjazz";

/// Test harness for spawning the connector service in tests.
///
/// # Example
/// ```rust,ignore
/// #[tokio::test]
/// async fn test_join_flow() -> anyhow::Result<()> {
///     let server = TestConnectorServer::spawn().await?;
///     let response = reqwest::Client::new()
///         .post(server.connector_url("m-1/join"))
///         .send()
///         .await?;
///     assert_eq!(response.status(), 200);
///     Ok(())
/// }
/// ```
pub struct TestConnectorServer {
    addr: SocketAddr,
    store: MemoryStore,
    state: Arc<AppState>,
    _handle: JoinHandle<()>,
}

impl TestConnectorServer {
    /// Spawn a server whose external API always succeeds.
    pub async fn spawn() -> Result<Self, anyhow::Error> {
        Self::spawn_with(Arc::new(MockJazzTransport::healthy()), &[]).await
    }

    /// Spawn a server over `transport`, with environment overrides applied on
    /// top of the test defaults.
    ///
    /// Test defaults keep retries fast (1ms backoff) and disable nothing else;
    /// the reconciliation worker is never started, tests drive cycles through
    /// `POST /connectors/{provider}/reconcile` or [`Self::state`].
    pub async fn spawn_with(
        transport: Arc<dyn JazzTransport>,
        overrides: &[(&str, &str)],
    ) -> Result<Self, anyhow::Error> {
        let mut vars = HashMap::from([
            (
                "DATABASE_URL".to_string(),
                "postgresql://test/test".to_string(),
            ),
            ("REDIS_URL".to_string(), "redis://test:6379".to_string()),
            ("BIND_ADDRESS".to_string(), "127.0.0.1:0".to_string()),
            ("CONNECTOR_PROVIDER".to_string(), TEST_PROVIDER.to_string()),
            (
                "SBERJAZZ_API_BASE".to_string(),
                "http://jazz.test".to_string(),
            ),
            ("SBERJAZZ_HTTP_RETRY_BACKOFF_MS".to_string(), "1".to_string()),
            (
                "SBERJAZZ_HTTP_RETRY_BACKOFF_CAP_MS".to_string(),
                "5".to_string(),
            ),
            ("SBERJAZZ_RECONCILE_ENABLED".to_string(), "false".to_string()),
            ("CONNECTOR_DRAIN_SECONDS".to_string(), "0".to_string()),
        ]);
        for (key, value) in overrides {
            vars.insert((*key).to_string(), (*value).to_string());
        }

        let config = Config::from_vars(&vars)
            .map_err(|e| anyhow::anyhow!("Failed to create config: {}", e))?;

        let store = MemoryStore::new();
        let shared = Arc::new(store.clone());
        let state = Arc::new(AppState::new(
            config,
            shared.clone(),
            shared.clone(),
            shared,
            transport,
        ));

        // Not installed globally: each server renders its own empty registry
        let metrics_handle = PrometheusBuilder::new().build_recorder().handle();
        let app = routes::build_routes(Arc::clone(&state), metrics_handle);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind test server: {}", e))?;

        let addr = listener
            .local_addr()
            .map_err(|e| anyhow::anyhow!("Failed to get local address: {}", e))?;

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                eprintln!("Test server error: {}", e);
            }
        });

        Ok(Self {
            addr,
            store,
            state,
            _handle: handle,
        })
    }

    /// Get the base URL of the test server.
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL under `/connectors/{provider}/`.
    pub fn connector_url(&self, path: &str) -> String {
        format!("http://{}/connectors/{}/{}", self.addr, TEST_PROVIDER, path)
    }

    /// Get the socket address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Shared in-memory store backing sessions, locks and the breaker.
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }

    /// Application state, for driving components directly.
    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Get reference to the server configuration.
    pub fn config(&self) -> &Config {
        &self.state.config
    }
}

impl Drop for TestConnectorServer {
    fn drop(&mut self) {
        self._handle.abort();
    }
}
