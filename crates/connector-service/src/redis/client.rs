//! Redis-backed lock and breaker store.
//!
//! # Key Patterns
//!
//! - `connector:{provider}:lock:{meeting_id}` - Operation lock (holder token, PX expiry)
//! - `connector:{provider}:breaker` - Circuit breaker state (HASH)
//!
//! # Connection Pattern
//!
//! The redis-rs `MultiplexedConnection` is cheap to clone and safe to use
//! concurrently, so every operation clones it instead of sharing a lock.
//! Every round trip runs under the command deadline; expiry is a
//! `ConnectorError::Store` like any other Redis failure.

use crate::errors::ConnectorError;
use crate::models::{BreakerState, CircuitBreakerSnapshot, ResetSource};
use crate::redis::lua_scripts;
use crate::store::{BreakerStore, LockStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

/// Redis hash key holding the breaker for a provider.
pub fn breaker_key(provider: &str) -> String {
    format!("connector:{provider}:breaker")
}

/// Await one Redis round trip, bounded by `deadline`.
///
/// # Errors
///
/// Returns `ConnectorError::Store` naming `action` if the command fails or
/// does not complete in time.
pub async fn bounded<T, F>(deadline: Duration, action: &str, command: F) -> Result<T, ConnectorError>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(deadline, command).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            warn!(target: "connector.redis", action, error = %e, "Redis command failed");
            Err(ConnectorError::Store(format!("Failed to {action}: {e}")))
        }
        Err(_) => {
            warn!(
                target: "connector.redis",
                action,
                timeout_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                "Redis command timed out"
            );
            Err(ConnectorError::Store(format!(
                "Failed to {action}: timed out after {deadline:?}"
            )))
        }
    }
}

/// Redis client for operation locks and breaker state.
#[derive(Clone)]
pub struct ConnectorRedisClient {
    connection: MultiplexedConnection,
    command_timeout: Duration,
    release_lock_script: Script,
    record_failure_script: Script,
    record_success_script: Script,
    reset_breaker_script: Script,
}

impl ConnectorRedisClient {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the client cannot be opened or the
    /// connection fails within `connect_timeout`.
    pub async fn new(
        redis_url: &str,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, ConnectorError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url, it may contain credentials
            error!(target: "connector.redis", error = %e, "Failed to open Redis client");
            ConnectorError::Store(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection_with_timeouts(command_timeout, connect_timeout)
            .await
            .map_err(|e| {
                error!(target: "connector.redis", error = %e, "Failed to connect to Redis");
                ConnectorError::Store(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            command_timeout,
            release_lock_script: Script::new(lua_scripts::RELEASE_LOCK),
            record_failure_script: Script::new(lua_scripts::RECORD_FAILURE),
            record_success_script: Script::new(lua_scripts::RECORD_SUCCESS),
            reset_breaker_script: Script::new(lua_scripts::RESET_BREAKER),
        })
    }
}

#[async_trait]
impl LockStore for ConnectorRedisClient {
    #[instrument(skip_all, fields(key = %key))]
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, ConnectorError> {
        let mut conn = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        let result: Option<String> = bounded(
            self.command_timeout,
            "acquire lock",
            redis::cmd("SET")
                .arg(key)
                .arg(token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn),
        )
        .await?;

        Ok(result.is_some())
    }

    #[instrument(skip_all, fields(key = %key))]
    async fn unlock(&self, key: &str, token: &str) -> Result<bool, ConnectorError> {
        let mut conn = self.connection.clone();

        let released: i64 = bounded(
            self.command_timeout,
            "release lock",
            self.release_lock_script
                .key(key)
                .arg(token)
                .invoke_async(&mut conn),
        )
        .await?;

        Ok(released == 1)
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        let mut conn = self.connection.clone();
        let _: String = bounded(
            self.command_timeout,
            "ping Redis",
            redis::cmd("PING").query_async(&mut conn),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl BreakerStore for ConnectorRedisClient {
    #[instrument(skip_all, fields(provider = %provider))]
    async fn load(&self, provider: &str) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let mut conn = self.connection.clone();
        let key = breaker_key(provider);
        let fields: HashMap<String, String> =
            bounded(self.command_timeout, "load breaker", conn.hgetall(&key)).await?;
        Ok(snapshot_from_hash(&fields))
    }

    #[instrument(skip_all, fields(provider = %provider))]
    async fn record_success(&self, provider: &str) -> Result<(), ConnectorError> {
        let mut conn = self.connection.clone();
        let _: i64 = bounded(
            self.command_timeout,
            "record breaker success",
            self.record_success_script
                .key(breaker_key(provider))
                .invoke_async(&mut conn),
        )
        .await?;
        Ok(())
    }

    #[instrument(skip_all, fields(provider = %provider))]
    async fn record_failure(
        &self,
        provider: &str,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let mut conn = self.connection.clone();
        let (state, failures, opened_at_ms): (String, i64, String) = bounded(
            self.command_timeout,
            "record breaker failure",
            self.record_failure_script
                .key(breaker_key(provider))
                .arg(threshold)
                .arg(now.timestamp_millis())
                .arg(reason)
                .invoke_async(&mut conn),
        )
        .await?;

        debug!(
            target: "connector.redis",
            state = %state,
            consecutive_failures = failures,
            "Recorded breaker failure"
        );

        // Re-read the rest of the hash for reset metadata
        let mut snapshot = self.load(provider).await?;
        snapshot.state = BreakerState::parse(&state).unwrap_or(BreakerState::Closed);
        snapshot.consecutive_failures = u32::try_from(failures).unwrap_or(u32::MAX);
        snapshot.opened_at = parse_millis(&opened_at_ms);
        Ok(snapshot)
    }

    #[instrument(skip_all, fields(provider = %provider, source = source.as_str()))]
    async fn reset(
        &self,
        provider: &str,
        source: ResetSource,
        now: DateTime<Utc>,
        expected_opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ConnectorError> {
        let mut conn = self.connection.clone();
        let expected = expected_opened_at
            .map(|t| t.timestamp_millis().to_string())
            .unwrap_or_default();

        let closed: i64 = bounded(
            self.command_timeout,
            "reset breaker",
            self.reset_breaker_script
                .key(breaker_key(provider))
                .arg(expected)
                .arg(now.timestamp_millis())
                .arg(source.as_str())
                .invoke_async(&mut conn),
        )
        .await?;

        Ok(closed == 1)
    }
}

fn parse_millis(raw: &str) -> Option<DateTime<Utc>> {
    raw.parse::<i64>()
        .ok()
        .and_then(DateTime::from_timestamp_millis)
}

/// Build a breaker snapshot from its Redis hash. Missing fields read as a
/// fresh Closed breaker.
pub fn snapshot_from_hash(fields: &HashMap<String, String>) -> CircuitBreakerSnapshot {
    let state = fields
        .get("state")
        .and_then(|s| BreakerState::parse(s))
        .unwrap_or(BreakerState::Closed);

    let opened_at = match state {
        BreakerState::Open => fields.get("opened_at_ms").and_then(|v| parse_millis(v)),
        BreakerState::Closed => None,
    };

    CircuitBreakerSnapshot {
        state,
        consecutive_failures: fields
            .get("consecutive_failures")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0),
        opened_at,
        last_failure_reason: fields.get("last_failure_reason").cloned(),
        last_reset_at: fields.get("last_reset_at_ms").and_then(|v| parse_millis(v)),
        last_reset_source: fields
            .get("last_reset_source")
            .and_then(|s| ResetSource::parse(s)),
    }
}
