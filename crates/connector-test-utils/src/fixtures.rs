//! Session and breaker fixtures.
//!
//! Timestamps are relative to `now` so fixtures land on either side of the
//! staleness and cooldown thresholds the tests configure.

use chrono::{DateTime, Duration, Utc};
use common::types::MeetingId;
use connector_service::models::{
    BreakerState, CircuitBreakerSnapshot, ConnectorSession, SessionState,
};

use crate::server_harness::TEST_PROVIDER;

pub fn meeting(id: &str) -> MeetingId {
    MeetingId::parse(id).expect("fixture meeting id should be valid")
}

/// Session in `state` last written `age` ago.
///
/// Connected and Stale sessions get an external session id and a heartbeat
/// equal to `updated_at`.
pub fn session(id: &str, state: SessionState, age: Duration) -> ConnectorSession {
    let now = Utc::now();
    let updated_at = now - age;
    let mut session = ConnectorSession::new(meeting(id), TEST_PROVIDER, updated_at);
    session.state = state;
    if state.requires_heartbeat() {
        session.external_session_id = Some(format!("jazz-{id}"));
        session.last_heartbeat_at = Some(updated_at);
    }
    if state == SessionState::Failed {
        session.retry_count = 1;
        session.last_error = Some("fixture failure".to_string());
    }
    session
}

/// Connected session whose heartbeat is `heartbeat_age` old.
pub fn connected_session(id: &str, heartbeat_age: Duration) -> ConnectorSession {
    session(id, SessionState::Connected, heartbeat_age)
}

/// Failed session that had been connected before.
pub fn failed_session(id: &str) -> ConnectorSession {
    let mut session = session(id, SessionState::Failed, Duration::seconds(5));
    session.external_session_id = Some(format!("jazz-{id}"));
    session
}

/// Open breaker, opened at `opened_at`.
pub fn open_breaker(opened_at: DateTime<Utc>, consecutive_failures: u32) -> CircuitBreakerSnapshot {
    CircuitBreakerSnapshot {
        state: BreakerState::Open,
        consecutive_failures,
        opened_at: Some(opened_at),
        last_failure_reason: Some("unavailable: HTTP 503".to_string()),
        last_reset_at: None,
        last_reset_source: None,
    }
}
