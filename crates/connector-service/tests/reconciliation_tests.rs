//! Reconciliation integration tests.
//!
//! Seeds the shared store with degraded sessions and drives cycles through
//! `POST /connectors/{provider}/reconcile`.

// Test code is allowed to use expect/unwrap for assertions
#![allow(clippy::unwrap_used, clippy::expect_used)]

use anyhow::Result;
use chrono::{Duration, Utc};
use connector_service::models::{BreakerState, RunSource, SessionState};
use connector_service::services::jazz_client::mock::{MockJazzTransport, MockReply};
use connector_service::services::jazz_client::JazzOperation;
use connector_service::store::{BreakerStore, SessionStore};
use connector_test_utils::{
    connected_session, failed_session, meeting, open_breaker, session, TestConnectorServer,
};
use serde_json::Value;
use std::sync::Arc;

async fn reconcile(server: &TestConnectorServer) -> Result<Value> {
    let response = reqwest::Client::new()
        .post(server.connector_url("reconcile"))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    Ok(response.json().await?)
}

async fn state_of(server: &TestConnectorServer, id: &str) -> SessionState {
    server
        .store()
        .get(&meeting(id))
        .await
        .unwrap()
        .expect("session should exist")
        .state
}

#[tokio::test]
async fn test_cycle_repairs_stale_and_failed_sessions() -> Result<()> {
    let transport = Arc::new(MockJazzTransport::healthy());
    let server = TestConnectorServer::spawn_with(transport.clone(), &[]).await?;
    let store = server.store();
    store
        .insert_session(connected_session("stale", Duration::seconds(600)))
        .await;
    store.insert_session(failed_session("failed")).await;
    store
        .insert_session(connected_session("fresh", Duration::seconds(5)))
        .await;

    let run = reconcile(&server).await?;

    assert_eq!(run["scanned"], 3);
    assert_eq!(run["stale_marked"], 1);
    assert_eq!(run["reconnect_attempted"], 2);
    assert_eq!(run["reconnect_succeeded"], 2);
    assert_eq!(run["reconnect_failed"], 0);
    assert_eq!(state_of(&server, "stale").await, SessionState::Connected);
    assert_eq!(state_of(&server, "failed").await, SessionState::Connected);
    assert_eq!(state_of(&server, "fresh").await, SessionState::Connected);
    // Both had an external session, so both were resumed rather than rejoined
    assert_eq!(transport.calls_for(JazzOperation::Reconnect), 2);
    assert_eq!(transport.calls_for(JazzOperation::Join), 0);
    Ok(())
}

#[tokio::test]
async fn test_failed_reconnect_leaves_session_failed() -> Result<()> {
    let transport = Arc::new(MockJazzTransport::failing_with_status(503));
    let server =
        TestConnectorServer::spawn_with(transport, &[("SBERJAZZ_HTTP_RETRIES", "0")]).await?;
    server
        .store()
        .insert_session(connected_session("m-1", Duration::seconds(600)))
        .await;

    let run = reconcile(&server).await?;

    assert_eq!(run["stale_marked"], 1);
    assert_eq!(run["reconnect_failed"], 1);
    assert_eq!(run["outcomes"][0]["result"], "failed");

    let stored = server.store().get(&meeting("m-1")).await?.unwrap();
    assert_eq!(stored.state, SessionState::Failed);
    assert_eq!(stored.retry_count, 1);
    Ok(())
}

#[tokio::test]
async fn test_batch_limit_caps_reconnects_per_cycle() -> Result<()> {
    let server = TestConnectorServer::spawn_with(
        Arc::new(MockJazzTransport::healthy()),
        &[("SBERJAZZ_RECONCILE_LIMIT", "2")],
    )
    .await?;
    for id in ["a", "b", "c", "d", "e"] {
        server.store().insert_session(failed_session(id)).await;
    }

    let first = reconcile(&server).await?;
    assert_eq!(first["reconnect_attempted"], 2);

    let second = reconcile(&server).await?;
    assert_eq!(second["scanned"], 5);
    assert_eq!(second["reconnect_attempted"], 2);

    let third = reconcile(&server).await?;
    assert_eq!(third["reconnect_attempted"], 1);
    Ok(())
}

#[tokio::test]
async fn test_open_breaker_skips_batch_then_auto_resets() -> Result<()> {
    let transport = Arc::new(MockJazzTransport::healthy());
    let server = TestConnectorServer::spawn_with(
        transport.clone(),
        &[
            ("SBERJAZZ_CB_OPEN_SECONDS", "60"),
            ("SBERJAZZ_CB_AUTO_RESET_MIN_AGE_SECONDS", "30"),
        ],
    )
    .await?;
    server
        .store()
        .insert_session(connected_session("m-1", Duration::seconds(600)))
        .await;
    server
        .store()
        .set_breaker("sberjazz", open_breaker(Utc::now() - Duration::minutes(5), 5))
        .await;

    let run = reconcile(&server).await?;

    // The batch is judged before the reset; the session waits for the next cycle
    assert_eq!(run["skipped_circuit_open"], 1);
    assert_eq!(run["reconnect_attempted"], 0);
    assert_eq!(run["breaker_resets"], 1);
    assert_eq!(transport.call_count(), 0);
    assert_eq!(state_of(&server, "m-1").await, SessionState::Stale);

    let snapshot = server.store().load("sberjazz").await?;
    assert_eq!(snapshot.state, BreakerState::Closed);

    let run = reconcile(&server).await?;
    assert_eq!(run["reconnect_succeeded"], 1);
    assert_eq!(state_of(&server, "m-1").await, SessionState::Connected);
    Ok(())
}

#[tokio::test]
async fn test_recently_opened_breaker_is_not_auto_reset() -> Result<()> {
    let server = TestConnectorServer::spawn().await?;
    server
        .store()
        .set_breaker("sberjazz", open_breaker(Utc::now() - Duration::seconds(10), 5))
        .await;

    let run = reconcile(&server).await?;

    assert_eq!(run["breaker_resets"], 0);
    assert!(server.store().load("sberjazz").await?.is_open());
    Ok(())
}

#[tokio::test]
async fn test_auto_reset_disabled() -> Result<()> {
    let server = TestConnectorServer::spawn_with(
        Arc::new(MockJazzTransport::healthy()),
        &[("SBERJAZZ_CB_AUTO_RESET_ENABLED", "false")],
    )
    .await?;
    server
        .store()
        .set_breaker("sberjazz", open_breaker(Utc::now() - Duration::hours(1), 5))
        .await;

    let run = reconcile(&server).await?;

    assert_eq!(run["breaker_resets"], 0);
    assert!(server.store().load("sberjazz").await?.is_open());
    Ok(())
}

#[tokio::test]
async fn test_abandoned_operation_is_failed_and_repaired() -> Result<()> {
    let server = TestConnectorServer::spawn_with(
        Arc::new(MockJazzTransport::healthy()),
        &[
            ("SBERJAZZ_RECONCILE_STALE_SECONDS", "60"),
            ("SBERJAZZ_OP_LOCK_TTL_SECONDS", "30"),
        ],
    )
    .await?;
    // Stuck well past stale threshold + lock TTL with nobody holding the lock
    server
        .store()
        .insert_session(session("stuck", SessionState::Connecting, Duration::seconds(300)))
        .await;
    // Young enough that its operation may still be running
    server
        .store()
        .insert_session(session("young", SessionState::Connecting, Duration::seconds(10)))
        .await;

    let run = reconcile(&server).await?;

    assert_eq!(run["abandoned_failed"], 1);
    assert_eq!(run["reconnect_succeeded"], 1);
    assert_eq!(state_of(&server, "stuck").await, SessionState::Connected);
    assert_eq!(state_of(&server, "young").await, SessionState::Connecting);
    Ok(())
}

#[tokio::test]
async fn test_mid_batch_breaker_trip_stops_batch() -> Result<()> {
    let transport = Arc::new(MockJazzTransport::with_replies(vec![
        MockReply::Status(503),
        MockReply::Status(503),
    ]));
    let server = TestConnectorServer::spawn_with(
        transport.clone(),
        &[
            ("SBERJAZZ_HTTP_RETRIES", "0"),
            ("SBERJAZZ_CB_FAILURE_THRESHOLD", "2"),
        ],
    )
    .await?;
    for id in ["a", "b", "c", "d"] {
        server.store().insert_session(failed_session(id)).await;
    }

    let run = reconcile(&server).await?;

    assert_eq!(run["reconnect_failed"], 2);
    assert_eq!(run["skipped_circuit_open"], 2);
    assert_eq!(transport.call_count(), 2);
    Ok(())
}

#[tokio::test]
async fn test_worker_runs_cycles_directly() -> Result<()> {
    let server = TestConnectorServer::spawn().await?;
    server.store().insert_session(failed_session("m-1")).await;

    let run = server.state().reconciler.run_cycle(RunSource::Job).await?;

    assert_eq!(run.source, RunSource::Job);
    assert_eq!(run.reconnect_succeeded, 1);
    Ok(())
}
