//! Data models for the connector service.

use chrono::{DateTime, SubsecRound, Utc};
use common::types::MeetingId;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Current time truncated to the microsecond precision of the session store.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Connector session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Stale,
    Failed,
}

impl SessionState {
    /// All states, in display order.
    pub const ALL: [SessionState; 6] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Reconnecting,
        SessionState::Stale,
        SessionState::Failed,
    ];

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Stale => "stale",
            SessionState::Failed => "failed",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Option<Self> {
        SessionState::ALL.into_iter().find(|state| state.as_db_str() == s)
    }

    /// Whether the state machine permits `self -> next`.
    ///
    /// Self-transitions are allowed only where an operation legitimately
    /// rewrites the same state (heartbeat on Connected, a retried reconnect).
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Failed)
                | (Connecting, Disconnected)
                | (Connected, Connected)
                | (Connected, Reconnecting)
                | (Connected, Stale)
                | (Connected, Disconnected)
                | (Reconnecting, Reconnecting)
                | (Reconnecting, Connected)
                | (Reconnecting, Failed)
                | (Reconnecting, Disconnected)
                | (Stale, Reconnecting)
                | (Stale, Connected)
                | (Stale, Disconnected)
                | (Failed, Connecting)
                | (Failed, Reconnecting)
                | (Failed, Disconnected)
        )
    }

    /// States in which `last_heartbeat_at` must be set.
    pub fn requires_heartbeat(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Reconnecting | SessionState::Stale
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// Durable record of the connector's involvement in one meeting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorSession {
    pub meeting_id: MeetingId,
    pub provider: String,
    pub external_session_id: Option<String>,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
    pub last_error: Option<String>,
}

impl ConnectorSession {
    /// A fresh Disconnected session, as created on first join.
    pub fn new(meeting_id: MeetingId, provider: &str, now: DateTime<Utc>) -> Self {
        Self {
            meeting_id,
            provider: provider.to_string(),
            external_session_id: None,
            state: SessionState::Disconnected,
            created_at: now,
            updated_at: now,
            last_heartbeat_at: None,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Connected session whose heartbeat is older than `cutoff` (or missing).
    pub fn is_stale_at(&self, cutoff: DateTime<Utc>) -> bool {
        self.state == SessionState::Connected
            && self.last_heartbeat_at.map_or(true, |hb| hb < cutoff)
    }

    /// Connecting/Reconnecting session not touched since `cutoff`.
    pub fn is_abandoned_at(&self, cutoff: DateTime<Utc>) -> bool {
        matches!(
            self.state,
            SessionState::Connecting | SessionState::Reconnecting
        ) && self.updated_at < cutoff
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "closed" => Some(BreakerState::Closed),
            "open" => Some(BreakerState::Open),
            _ => None,
        }
    }
}

/// Who reset the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetSource {
    Manual,
    Auto,
}

impl ResetSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResetSource::Manual => "manual",
            ResetSource::Auto => "auto",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(ResetSource::Manual),
            "auto" => Some(ResetSource::Auto),
            _ => None,
        }
    }
}

/// Point-in-time view of the per-connector circuit breaker.
///
/// `opened_at` is set iff `state` is Open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub opened_at: Option<DateTime<Utc>>,
    pub last_failure_reason: Option<String>,
    pub last_reset_at: Option<DateTime<Utc>>,
    pub last_reset_source: Option<ResetSource>,
}

impl CircuitBreakerSnapshot {
    /// Initial Closed breaker.
    pub fn closed() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            last_failure_reason: None,
            last_reset_at: None,
            last_reset_source: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == BreakerState::Open
    }
}

impl Default for CircuitBreakerSnapshot {
    fn default() -> Self {
        Self::closed()
    }
}

/// What triggered a reconciliation cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    /// Periodic background worker.
    Job,
    /// Admin API call.
    Manual,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunSource::Job => "job",
            RunSource::Manual => "manual",
        }
    }
}

/// Outcome of one reconnect attempted by the reconciliation worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionOutcome {
    pub meeting_id: MeetingId,
    /// `connected`, `failed`, `busy`, `circuit_open` or `skipped`.
    pub result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of one reconciliation cycle. Not persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationRun {
    pub run_id: Uuid,
    pub source: RunSource,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub scanned: usize,
    pub stale_marked: usize,
    pub stale_found: usize,
    pub abandoned_failed: usize,
    pub reconnect_attempted: usize,
    pub reconnect_succeeded: usize,
    pub reconnect_failed: usize,
    pub skipped_busy: usize,
    pub skipped_circuit_open: usize,
    pub breaker_resets: usize,
    pub errors: usize,
    pub outcomes: Vec<SessionOutcome>,
}

impl ReconciliationRun {
    pub fn new(source: RunSource, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source,
            started_at,
            duration_ms: 0,
            scanned: 0,
            stale_marked: 0,
            stale_found: 0,
            abandoned_failed: 0,
            reconnect_attempted: 0,
            reconnect_succeeded: 0,
            reconnect_failed: 0,
            skipped_busy: 0,
            skipped_circuit_open: 0,
            breaker_resets: 0,
            errors: 0,
            outcomes: Vec::new(),
        }
    }
}

/// Response for `GET /connectors/{provider}/{meeting_id}/status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorStatusResponse {
    pub session: ConnectorSession,
    pub circuit_breaker: CircuitBreakerSnapshot,
}

/// Response for `GET /connectors/{provider}/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectorHealthResponse {
    pub provider: String,
    /// `healthy`, `degraded` or `unhealthy`.
    pub status: String,
    pub circuit_breaker: CircuitBreakerSnapshot,
    /// Failure ratio over the recent call window (0.0 when empty).
    pub recent_error_rate: f64,
    pub recent_calls: usize,
    /// `reachable`, `unreachable` or `skipped` (breaker open).
    pub external_api: String,
}

/// Response for `GET /connectors/{provider}/sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionListResponse {
    pub provider: String,
    pub count: usize,
    pub sessions: Vec<ConnectorSession>,
}

/// Optional body for `POST /connectors/{provider}/circuit-breaker/reset`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResetRequest {
    pub reason: Option<String>,
}

/// Query for `GET /connectors/{provider}/sessions`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListSessionsQuery {
    pub limit: Option<usize>,
}

/// Service health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub session_store: String,
    pub lock_store: String,
}
