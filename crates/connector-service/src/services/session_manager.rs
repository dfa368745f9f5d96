//! Connector session state machine.
//!
//! Every mutating operation (join, reconnect, leave, heartbeat) runs under the
//! per-meeting [`OperationLock`], performs exactly one logical external call
//! (retries belong to [`ResilientJazzClient`]) and persists each state change
//! it passes through. `status` is a lock-free read.
//!
//! The reconciliation worker uses [`SessionManager::mark_stale`] and
//! [`SessionManager::mark_abandoned`], which write without the lock through an
//! optimistic compare-and-update on `(state, updated_at)`.

use crate::errors::ConnectorError;
use crate::models::{
    utc_now, CircuitBreakerSnapshot, ConnectorSession, ConnectorStatusResponse, SessionState,
};
use crate::observability::metrics;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::jazz_client::JoinResult;
use crate::services::operation_lock::OperationLock;
use crate::services::resilience::ResilientJazzClient;
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use std::future::Future;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Maximum stored length of `last_error`.
const MAX_LAST_ERROR_CHARS: usize = 500;

fn error_summary(err: &ConnectorError) -> String {
    err.to_string().chars().take(MAX_LAST_ERROR_CHARS).collect()
}

/// Apply a state change, enforcing the transition table and keeping
/// `updated_at` strictly increasing so optimistic writes see every change.
fn transition(
    session: &mut ConnectorSession,
    next: SessionState,
    now: DateTime<Utc>,
) -> Result<(), ConnectorError> {
    if !session.state.can_transition_to(next) {
        return Err(ConnectorError::InvalidState(format!(
            "meeting {} cannot move from {} to {}",
            session.meeting_id, session.state, next
        )));
    }
    session.state = next;
    session.updated_at = if now > session.updated_at {
        now
    } else {
        session.updated_at + chrono::Duration::microseconds(1)
    };
    Ok(())
}

/// Session lifecycle coordinator for one provider.
pub struct SessionManager {
    provider: String,
    store: Arc<dyn SessionStore>,
    lock: OperationLock,
    client: Arc<ResilientJazzClient>,
}

impl SessionManager {
    pub fn new(
        provider: &str,
        store: Arc<dyn SessionStore>,
        lock: OperationLock,
        client: Arc<ResilientJazzClient>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            store,
            lock,
            client,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.client.breaker()
    }

    /// Connect the meeting.
    ///
    /// Valid with no stored session or from Disconnected/Failed.
    ///
    /// # Errors
    ///
    /// - `Busy` if another operation holds the meeting lock
    /// - `InvalidState` if the session is already active
    /// - `CircuitOpen` if the breaker is Open (no external call, session marked Failed)
    /// - `ExternalApi` if the external call failed (session marked Failed)
    /// - `Store` if the session store is unreachable
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn join(&self, meeting_id: &MeetingId) -> Result<ConnectorSession, ConnectorError> {
        self.locked("join", meeting_id, || self.join_locked(meeting_id))
            .await
    }

    /// Restore a degraded session.
    ///
    /// Valid from Connected, Reconnecting, Stale and Failed. Resumes the
    /// external session when one is known, otherwise joins anew.
    ///
    /// # Errors
    ///
    /// Same as [`SessionManager::join`], plus `NotFound` for an unknown meeting.
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn reconnect(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<ConnectorSession, ConnectorError> {
        self.locked("reconnect", meeting_id, || self.reconnect_locked(meeting_id))
            .await
    }

    /// Disconnect the meeting. Idempotent on a Disconnected session.
    ///
    /// The external leave is best effort: its failure is logged and the
    /// session is still closed locally.
    ///
    /// # Errors
    ///
    /// - `Busy` if another operation holds the meeting lock
    /// - `NotFound` for an unknown meeting
    /// - `Store` if the session store is unreachable
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn leave(&self, meeting_id: &MeetingId) -> Result<ConnectorSession, ConnectorError> {
        self.locked("leave", meeting_id, || self.leave_locked(meeting_id))
            .await
    }

    /// Record liveness reported by the media ingest side.
    ///
    /// Refreshes a Connected session and promotes a Stale one back to
    /// Connected.
    ///
    /// # Errors
    ///
    /// - `Busy` if another operation holds the meeting lock
    /// - `NotFound` for an unknown meeting
    /// - `InvalidState` from any other state
    /// - `Store` if the session store is unreachable
    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    pub async fn heartbeat(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<ConnectorSession, ConnectorError> {
        self.locked("heartbeat", meeting_id, || self.heartbeat_locked(meeting_id))
            .await
    }

    /// Stored session plus breaker snapshot, read without the lock.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown meeting
    /// - `Store` if either store is unreachable
    pub async fn status(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<ConnectorStatusResponse, ConnectorError> {
        let session = self.require(meeting_id).await?;
        let circuit_breaker = self.breaker().snapshot().await?;
        Ok(ConnectorStatusResponse {
            session,
            circuit_breaker,
        })
    }

    /// Most recently updated sessions first. Also refreshes the per-state
    /// session gauges.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the session store is unreachable.
    pub async fn list_sessions(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError> {
        let sessions = self.store.list(limit).await?;
        self.refresh_session_gauges().await;
        Ok(sessions)
    }

    /// Current breaker snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Store` if the breaker store is unreachable.
    pub async fn breaker_snapshot(&self) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        self.breaker().snapshot().await
    }

    /// Publish per-state session counts. Store failures are logged.
    pub async fn refresh_session_gauges(&self) {
        match self.store.count_by_state().await {
            Ok(counts) => metrics::set_session_counts(&counts),
            Err(e) => warn!(
                target: "connector.session",
                error = %e,
                "Failed to refresh session gauges"
            ),
        }
    }

    /// Move a Connected session with an expired heartbeat to Stale.
    ///
    /// Returns `false` if the stored session changed since `session` was read.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if `session` is not Connected
    /// - `Store` if the session store is unreachable
    pub async fn mark_stale(
        &self,
        session: &ConnectorSession,
        now: DateTime<Utc>,
    ) -> Result<bool, ConnectorError> {
        let mut updated = session.clone();
        transition(&mut updated, SessionState::Stale, now)?;
        let written = self
            .store
            .compare_and_update(&updated, session.state, session.updated_at)
            .await?;
        if written {
            info!(
                target: "connector.session",
                meeting_id = %session.meeting_id,
                last_heartbeat_at = ?session.last_heartbeat_at,
                "Session marked stale"
            );
        }
        Ok(written)
    }

    /// Move a Connecting/Reconnecting session whose operation was abandoned
    /// (its lock holder died) to Failed so it can be repaired.
    ///
    /// Returns `false` if the stored session changed since `session` was read.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if `session` is not in an in-flight state
    /// - `Store` if the session store is unreachable
    pub async fn mark_abandoned(
        &self,
        session: &ConnectorSession,
        now: DateTime<Utc>,
    ) -> Result<bool, ConnectorError> {
        let mut updated = session.clone();
        transition(&mut updated, SessionState::Failed, now)?;
        updated.retry_count = updated.retry_count.saturating_add(1);
        updated.last_error = Some(format!("operation abandoned while {}", session.state));
        let written = self
            .store
            .compare_and_update(&updated, session.state, session.updated_at)
            .await?;
        if written {
            warn!(
                target: "connector.session",
                meeting_id = %session.meeting_id,
                state = %session.state,
                "Abandoned in-flight session marked failed"
            );
        }
        Ok(written)
    }

    async fn locked<'a, F, Fut>(
        &'a self,
        operation: &'static str,
        meeting_id: &'a MeetingId,
        body: F,
    ) -> Result<ConnectorSession, ConnectorError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectorSession, ConnectorError>> + 'a,
    {
        let result = match self.lock.try_acquire(meeting_id).await {
            Ok(guard) => {
                let result = body().await;
                guard.release().await;
                result
            }
            Err(e) => Err(e),
        };

        let label = match &result {
            Ok(_) => "success",
            Err(e) => e.code(),
        };
        metrics::record_operation(operation, label);
        result
    }

    async fn require(&self, meeting_id: &MeetingId) -> Result<ConnectorSession, ConnectorError> {
        self.store
            .get(meeting_id)
            .await?
            .ok_or_else(|| ConnectorError::NotFound(format!("no connector session for meeting {meeting_id}")))
    }

    async fn join_locked(&self, meeting_id: &MeetingId) -> Result<ConnectorSession, ConnectorError> {
        let now = utc_now();
        let mut session = match self.store.get(meeting_id).await? {
            Some(existing)
                if matches!(
                    existing.state,
                    SessionState::Disconnected | SessionState::Failed
                ) =>
            {
                existing
            }
            Some(existing) => {
                return Err(ConnectorError::InvalidState(format!(
                    "meeting {meeting_id} is already {}",
                    existing.state
                )))
            }
            None => ConnectorSession::new(meeting_id.clone(), &self.provider, now),
        };

        transition(&mut session, SessionState::Connecting, now)?;
        self.store.upsert(&session).await?;

        let result = self.client.join(meeting_id).await;
        self.complete(session, result).await
    }

    async fn reconnect_locked(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<ConnectorSession, ConnectorError> {
        let mut session = self.require(meeting_id).await?;
        if !matches!(
            session.state,
            SessionState::Connected
                | SessionState::Reconnecting
                | SessionState::Stale
                | SessionState::Failed
        ) {
            return Err(ConnectorError::InvalidState(format!(
                "meeting {meeting_id} cannot reconnect from {}",
                session.state
            )));
        }

        // Reconnecting requires a heartbeat; a session that never connected
        // goes through Connecting instead.
        let next = if session.last_heartbeat_at.is_some() {
            SessionState::Reconnecting
        } else {
            SessionState::Connecting
        };
        transition(&mut session, next, utc_now())?;
        self.store.upsert(&session).await?;

        let result = match session.external_session_id.clone() {
            Some(external_id) => self.client.reconnect(meeting_id, &external_id).await,
            None => self.client.join(meeting_id).await,
        };
        self.complete(session, result).await
    }

    async fn leave_locked(&self, meeting_id: &MeetingId) -> Result<ConnectorSession, ConnectorError> {
        let mut session = self.require(meeting_id).await?;
        if session.state == SessionState::Disconnected {
            return Ok(session);
        }

        if let Err(e) = self
            .client
            .leave(meeting_id, session.external_session_id.as_deref())
            .await
        {
            warn!(
                target: "connector.session",
                meeting_id = %meeting_id,
                error = %e,
                "External leave failed, closing session locally"
            );
        }

        transition(&mut session, SessionState::Disconnected, utc_now())?;
        session.external_session_id = None;
        session.last_heartbeat_at = None;
        self.store.upsert(&session).await?;

        info!(target: "connector.session", meeting_id = %meeting_id, "Connector left meeting");
        Ok(session)
    }

    async fn heartbeat_locked(
        &self,
        meeting_id: &MeetingId,
    ) -> Result<ConnectorSession, ConnectorError> {
        let mut session = self.require(meeting_id).await?;
        if !matches!(session.state, SessionState::Connected | SessionState::Stale) {
            return Err(ConnectorError::InvalidState(format!(
                "meeting {meeting_id} does not accept heartbeats while {}",
                session.state
            )));
        }

        let now = utc_now();
        let was_stale = session.state == SessionState::Stale;
        transition(&mut session, SessionState::Connected, now)?;
        session.last_heartbeat_at = Some(session.updated_at);
        self.store.upsert(&session).await?;

        if was_stale {
            info!(
                target: "connector.session",
                meeting_id = %meeting_id,
                "Heartbeat resumed, stale session restored"
            );
        }
        Ok(session)
    }

    /// Persist the outcome of a join/reconnect call.
    async fn complete(
        &self,
        mut session: ConnectorSession,
        result: Result<JoinResult, ConnectorError>,
    ) -> Result<ConnectorSession, ConnectorError> {
        let now = utc_now();
        match result {
            Ok(joined) => {
                transition(&mut session, SessionState::Connected, now)?;
                session.external_session_id = Some(joined.external_session_id);
                session.last_heartbeat_at = Some(session.updated_at);
                session.retry_count = 0;
                session.last_error = None;
                self.store.upsert(&session).await?;

                info!(
                    target: "connector.session",
                    meeting_id = %session.meeting_id,
                    language = %joined.language,
                    "Connector session connected"
                );
                Ok(session)
            }
            Err(err) => {
                transition(&mut session, SessionState::Failed, now)?;
                session.retry_count = session.retry_count.saturating_add(1);
                session.last_error = Some(error_summary(&err));
                if let Err(store_err) = self.store.upsert(&session).await {
                    warn!(
                        target: "connector.session",
                        meeting_id = %session.meeting_id,
                        error = %store_err,
                        "Failed to persist failed session"
                    );
                }

                warn!(
                    target: "connector.session",
                    meeting_id = %session.meeting_id,
                    code = err.code(),
                    retry_count = session.retry_count,
                    "Connector session failed"
                );
                Err(err)
            }
        }
    }
}
