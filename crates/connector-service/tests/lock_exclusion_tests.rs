//! Operation lock integration tests.
//!
//! Fires concurrent operations at the same meeting, through one server and
//! through two service instances sharing a store, and checks that the
//! external API never sees overlapping calls for a meeting.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use connector_service::config::Config;
use connector_service::errors::ConnectorError;
use connector_service::models::SessionState;
use connector_service::routes::AppState;
use connector_service::services::jazz_client::mock::MockJazzTransport;
use connector_service::store::memory::MemoryStore;
use connector_service::store::SessionStore;
use connector_service::models::ConnectorSession;
use connector_test_utils::{meeting, session, TestConnectorServer};
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn config() -> Config {
    let vars = HashMap::from([
        (
            "DATABASE_URL".to_string(),
            "postgresql://test/test".to_string(),
        ),
        ("REDIS_URL".to_string(), "redis://test:6379".to_string()),
        (
            "SBERJAZZ_API_BASE".to_string(),
            "http://jazz.test".to_string(),
        ),
    ]);
    Config::from_vars(&vars).unwrap()
}

fn instance(store: &MemoryStore, transport: Arc<MockJazzTransport>) -> AppState {
    let shared = Arc::new(store.clone());
    AppState::new(config(), shared.clone(), shared.clone(), shared, transport)
}

#[tokio::test]
async fn test_concurrent_joins_over_http_admit_one() -> Result<()> {
    let transport =
        Arc::new(MockJazzTransport::healthy().with_delay(Duration::from_millis(200)));
    let server = TestConnectorServer::spawn_with(transport.clone(), &[]).await?;
    let client = reqwest::Client::new();
    let url = server.connector_url("m-1/join");

    let statuses: Vec<u16> = join_all((0..8).map(|_| {
        let client = client.clone();
        let url = url.clone();
        async move {
            client
                .post(&url)
                .send()
                .await
                .map(|r| r.status().as_u16())
                .unwrap_or(0)
        }
    }))
    .await;

    assert_eq!(statuses.iter().filter(|s| **s == 200).count(), 1);
    assert!(statuses.iter().all(|s| *s == 200 || *s == 409), "{statuses:?}");
    assert_eq!(transport.max_in_flight_per_meeting(), 1);
    assert_eq!(transport.call_count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_two_instances_never_overlap_on_one_meeting() -> Result<()> {
    let store = MemoryStore::new();
    let transport =
        Arc::new(MockJazzTransport::healthy().with_delay(Duration::from_millis(100)));
    let first = instance(&store, transport.clone());
    let second = instance(&store, transport.clone());
    let m = meeting("m-1");

    let (a, b) = tokio::join!(first.manager.join(&m), second.manager.join(&m));

    let results = [a, b];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(ConnectorError::Busy(id)) if id == "m-1")));
    assert_eq!(transport.max_in_flight_per_meeting(), 1);

    let stored = store.get(&m).await?.unwrap();
    assert_eq!(stored.state, SessionState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_mixed_operations_never_overlap_on_one_meeting() -> Result<()> {
    let store = MemoryStore::new();
    let transport =
        Arc::new(MockJazzTransport::healthy().with_delay(Duration::from_millis(50)));
    let first = instance(&store, transport.clone());
    let second = instance(&store, transport.clone());
    let m = meeting("m-1");
    store
        .insert_session(session("m-1", SessionState::Stale, chrono::Duration::seconds(600)))
        .await;

    let mut busy = 0;
    for _ in 0..4 {
        let ops: Vec<BoxFuture<'_, Result<ConnectorSession, ConnectorError>>> = vec![
            first.manager.join(&m).boxed(),
            second.manager.reconnect(&m).boxed(),
            first.manager.leave(&m).boxed(),
            second.manager.join(&m).boxed(),
            first.manager.reconnect(&m).boxed(),
            second.manager.leave(&m).boxed(),
        ];
        let results = join_all(ops).await;

        assert!(
            results.iter().all(|r| matches!(
                r,
                Ok(_) | Err(ConnectorError::Busy(_) | ConnectorError::InvalidState(_))
            )),
            "{results:?}"
        );
        busy += results
            .iter()
            .filter(|r| matches!(r, Err(ConnectorError::Busy(_))))
            .count();
    }

    assert!(busy > 0);
    assert!(transport.call_count() > 0);
    assert_eq!(transport.max_in_flight_per_meeting(), 1);
    assert!(store.lock_holder("connector:sberjazz:lock:m-1").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_distinct_meetings_proceed_in_parallel() -> Result<()> {
    let store = MemoryStore::new();
    let transport =
        Arc::new(MockJazzTransport::healthy().with_delay(Duration::from_millis(100)));
    let state = instance(&store, transport.clone());

    let ids: Vec<_> = (0..5).map(|i| meeting(&format!("m-{i}"))).collect();
    let results = join_all(ids.iter().map(|m| state.manager.join(m))).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(transport.call_count(), 5);
    assert_eq!(transport.max_in_flight_per_meeting(), 1);
    Ok(())
}

#[tokio::test]
async fn test_lock_is_released_after_operation() -> Result<()> {
    let store = MemoryStore::new();
    let state = instance(&store, Arc::new(MockJazzTransport::healthy()));
    let m = meeting("m-1");

    state.manager.join(&m).await?;
    // Would be BUSY if the join had kept the lock
    let left = state.manager.leave(&m).await?;
    assert_eq!(left.state, SessionState::Disconnected);
    assert!(store.lock_holder("connector:sberjazz:lock:m-1").await.is_none());
    Ok(())
}
