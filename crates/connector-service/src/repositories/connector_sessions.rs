//! Connector sessions repository for database operations.
//!
//! Postgres implementation of [`SessionStore`] over the `connector_sessions`
//! table, one row per meeting.
//!
//! # Security
//!
//! - All queries use parameterized statements (SQL injection safe)
//! - `last_error` may carry external API response snippets and is never logged here

use crate::errors::ConnectorError;
use crate::models::{ConnectorSession, SessionState};
use crate::observability::metrics;
use crate::store::SessionStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use sqlx::PgPool;
use std::collections::HashMap;
use std::time::Instant;
use tracing::instrument;

const SESSION_COLUMNS: &str = "meeting_id, provider, external_session_id, state, created_at, \
     updated_at, last_heartbeat_at, retry_count, last_error";

/// Raw `connector_sessions` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ConnectorSessionRow {
    pub meeting_id: String,
    pub provider: String,
    pub external_session_id: Option<String>,
    pub state: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl TryFrom<ConnectorSessionRow> for ConnectorSession {
    type Error = ConnectorError;

    fn try_from(row: ConnectorSessionRow) -> Result<Self, Self::Error> {
        let meeting_id = MeetingId::parse(&row.meeting_id).map_err(|e| {
            ConnectorError::Store(format!("invalid meeting_id in connector_sessions: {e}"))
        })?;
        let state = SessionState::from_db_str(&row.state).ok_or_else(|| {
            ConnectorError::Store(format!(
                "unknown state '{}' in connector_sessions",
                row.state
            ))
        })?;

        Ok(ConnectorSession {
            meeting_id,
            provider: row.provider,
            external_session_id: row.external_session_id,
            state,
            created_at: row.created_at,
            updated_at: row.updated_at,
            last_heartbeat_at: row.last_heartbeat_at,
            retry_count: row.retry_count,
            last_error: row.last_error,
        })
    }
}

/// Postgres-backed session store.
#[derive(Clone)]
pub struct PgSessionStore {
    pool: PgPool,
}

impl PgSessionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn record<T>(operation: &str, start: Instant, result: &Result<T, sqlx::Error>) {
    let status = if result.is_ok() { "success" } else { "error" };
    metrics::record_db_query(operation, status, start.elapsed());
}

fn rows_to_sessions(rows: Vec<ConnectorSessionRow>) -> Result<Vec<ConnectorSession>, ConnectorError> {
    rows.into_iter().map(ConnectorSession::try_from).collect()
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl SessionStore for PgSessionStore {
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    async fn get(&self, meeting_id: &MeetingId) -> Result<Option<ConnectorSession>, ConnectorError> {
        let start = Instant::now();
        let result = sqlx::query_as::<_, ConnectorSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM connector_sessions WHERE meeting_id = $1"
        ))
        .bind(meeting_id.as_str())
        .fetch_optional(&self.pool)
        .await;
        record("get_session", start, &result);

        result?.map(ConnectorSession::try_from).transpose()
    }

    #[instrument(skip_all, fields(meeting_id = %session.meeting_id, state = %session.state))]
    async fn upsert(&self, session: &ConnectorSession) -> Result<(), ConnectorError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            INSERT INTO connector_sessions (
                meeting_id, provider, external_session_id, state, created_at,
                updated_at, last_heartbeat_at, retry_count, last_error
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (meeting_id) DO UPDATE SET
                provider = EXCLUDED.provider,
                external_session_id = EXCLUDED.external_session_id,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at,
                last_heartbeat_at = EXCLUDED.last_heartbeat_at,
                retry_count = EXCLUDED.retry_count,
                last_error = EXCLUDED.last_error
            "#,
        )
        .bind(session.meeting_id.as_str())
        .bind(&session.provider)
        .bind(&session.external_session_id)
        .bind(session.state.as_db_str())
        .bind(session.created_at)
        .bind(session.updated_at)
        .bind(session.last_heartbeat_at)
        .bind(session.retry_count)
        .bind(&session.last_error)
        .execute(&self.pool)
        .await;
        record("upsert_session", start, &result);

        result?;

        tracing::debug!(
            target: "connector.repository",
            meeting_id = %session.meeting_id,
            state = %session.state,
            "Connector session written"
        );

        Ok(())
    }

    #[instrument(skip_all, fields(meeting_id = %session.meeting_id, expected_state = %expected_state))]
    async fn compare_and_update(
        &self,
        session: &ConnectorSession,
        expected_state: SessionState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, ConnectorError> {
        let start = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE connector_sessions
            SET
                external_session_id = $2,
                state = $3,
                updated_at = $4,
                last_heartbeat_at = $5,
                retry_count = $6,
                last_error = $7
            WHERE meeting_id = $1 AND state = $8 AND updated_at = $9
            "#,
        )
        .bind(session.meeting_id.as_str())
        .bind(&session.external_session_id)
        .bind(session.state.as_db_str())
        .bind(session.updated_at)
        .bind(session.last_heartbeat_at)
        .bind(session.retry_count)
        .bind(&session.last_error)
        .bind(expected_state.as_db_str())
        .bind(expected_updated_at)
        .execute(&self.pool)
        .await;
        record("compare_and_update_session", start, &result);

        let updated = result?.rows_affected() == 1;
        if !updated {
            tracing::debug!(
                target: "connector.repository",
                meeting_id = %session.meeting_id,
                "Conditional session update lost to a concurrent write"
            );
        }
        Ok(updated)
    }

    #[instrument(skip_all, fields(limit = limit))]
    async fn list(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError> {
        let start = Instant::now();
        let result = sqlx::query_as::<_, ConnectorSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM connector_sessions ORDER BY updated_at DESC LIMIT $1"
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await;
        record("list_sessions", start, &result);

        rows_to_sessions(result?)
    }

    #[instrument(skip_all, fields(limit = limit))]
    async fn list_active(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError> {
        let start = Instant::now();
        let result = sqlx::query_as::<_, ConnectorSessionRow>(&format!(
            "SELECT {SESSION_COLUMNS} FROM connector_sessions \
             WHERE state <> 'disconnected' ORDER BY updated_at ASC LIMIT $1"
        ))
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await;
        record("list_active_sessions", start, &result);

        rows_to_sessions(result?)
    }

    async fn count_by_state(&self) -> Result<HashMap<SessionState, i64>, ConnectorError> {
        let start = Instant::now();
        let result: Result<Vec<(String, i64)>, sqlx::Error> =
            sqlx::query_as("SELECT state, COUNT(*) FROM connector_sessions GROUP BY state")
                .fetch_all(&self.pool)
                .await;
        record("count_sessions_by_state", start, &result);

        let mut counts = HashMap::new();
        for (state, count) in result? {
            match SessionState::from_db_str(&state) {
                Some(state) => {
                    counts.insert(state, count);
                }
                None => tracing::warn!(
                    target: "connector.repository",
                    state = %state,
                    "Ignoring unknown session state in counts"
                ),
            }
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::utc_now;

    fn row(meeting_id: &str, state: &str) -> ConnectorSessionRow {
        let now = utc_now();
        ConnectorSessionRow {
            meeting_id: meeting_id.to_string(),
            provider: "sberjazz".to_string(),
            external_session_id: Some("ext-1".to_string()),
            state: state.to_string(),
            created_at: now,
            updated_at: now,
            last_heartbeat_at: Some(now),
            retry_count: 2,
            last_error: None,
        }
    }

    #[test]
    fn test_row_converts_to_session() {
        let session = ConnectorSession::try_from(row("m-1", "connected")).unwrap();
        assert_eq!(session.meeting_id.as_str(), "m-1");
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.external_session_id.as_deref(), Some("ext-1"));
        assert_eq!(session.retry_count, 2);
    }

    #[test]
    fn test_row_with_unknown_state_is_store_error() {
        let result = ConnectorSession::try_from(row("m-1", "half_open"));
        assert!(matches!(result, Err(ConnectorError::Store(msg)) if msg.contains("half_open")));
    }

    #[test]
    fn test_row_with_invalid_meeting_id_is_store_error() {
        let result = ConnectorSession::try_from(row("bad id", "connected"));
        assert!(matches!(result, Err(ConnectorError::Store(_))));
    }

    #[test]
    fn test_limit_param_saturates() {
        assert_eq!(limit_param(20), 20);
        assert_eq!(limit_param(usize::MAX), i64::MAX);
    }
}
