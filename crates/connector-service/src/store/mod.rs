//! Storage seams for the connector core.
//!
//! The core needs a durable keyed store for sessions and a fast ephemeral
//! store with atomic set-if-absent, expiry and compare-and-delete for locks
//! and breaker state. Production uses Postgres and Redis; `memory` provides
//! an in-process implementation of all three traits for tests.

#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

use crate::errors::ConnectorError;
use crate::models::{CircuitBreakerSnapshot, ConnectorSession, ResetSource, SessionState};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use std::collections::HashMap;
use std::time::Duration;

/// Durable store of connector sessions, one record per meeting.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, meeting_id: &MeetingId) -> Result<Option<ConnectorSession>, ConnectorError>;

    /// Insert or overwrite the record for `session.meeting_id`.
    async fn upsert(&self, session: &ConnectorSession) -> Result<(), ConnectorError>;

    /// Overwrite only if the stored record still has `expected_state` and
    /// `expected_updated_at`. Returns whether the write happened.
    async fn compare_and_update(
        &self,
        session: &ConnectorSession,
        expected_state: SessionState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, ConnectorError>;

    /// Most recently updated sessions first.
    async fn list(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError>;

    /// Sessions not in Disconnected, least recently updated first.
    async fn list_active(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError>;

    async fn count_by_state(&self) -> Result<HashMap<SessionState, i64>, ConnectorError>;

    async fn ping(&self) -> Result<(), ConnectorError>;
}

/// Ephemeral TTL-bearing mutual exclusion, shared across instances.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// Atomically set `key = token` with expiry if `key` is absent.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, ConnectorError>;

    /// Delete `key` only if it still holds `token`.
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, ConnectorError>;

    async fn ping(&self) -> Result<(), ConnectorError>;
}

/// Shared per-connector circuit breaker state.
///
/// Every mutation is a single atomic step in the backing store, so any
/// number of instances can record outcomes concurrently.
#[async_trait]
pub trait BreakerStore: Send + Sync {
    async fn load(&self, provider: &str) -> Result<CircuitBreakerSnapshot, ConnectorError>;

    /// Clear the failure streak. No-op while Open.
    async fn record_success(&self, provider: &str) -> Result<(), ConnectorError>;

    /// Increment the failure streak and open the breaker at `now` once the
    /// streak reaches `threshold`.
    async fn record_failure(
        &self,
        provider: &str,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerSnapshot, ConnectorError>;

    /// Force Closed. With `expected_opened_at`, only resets a breaker that is
    /// still Open with that `opened_at` (millisecond precision). Returns
    /// whether an Open breaker was closed.
    async fn reset(
        &self,
        provider: &str,
        source: ResetSource,
        now: DateTime<Utc>,
        expected_opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ConnectorError>;
}
