//! In-memory stores for tests and local harnesses.
//!
//! One `MemoryStore` implements all three store traits. Lock expiry uses
//! `tokio::time::Instant`, so tests running with a paused clock can move
//! past a TTL with `tokio::time::advance`.

use super::{BreakerStore, LockStore, SessionStore};
use crate::errors::ConnectorError;
use crate::models::{
    BreakerState, CircuitBreakerSnapshot, ConnectorSession, ResetSource, SessionState,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<MeetingId, ConnectorSession>,
    locks: HashMap<String, (String, Instant)>,
    breakers: HashMap<String, CircuitBreakerSnapshot>,
}

/// In-memory session, lock and breaker store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every session store call fail with `StoreError` until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Seed or overwrite a session directly.
    pub async fn insert_session(&self, session: ConnectorSession) {
        let mut inner = self.inner.lock().await;
        inner.sessions.insert(session.meeting_id.clone(), session);
    }

    /// Seed or overwrite the breaker for a provider.
    pub async fn set_breaker(&self, provider: &str, snapshot: CircuitBreakerSnapshot) {
        let mut inner = self.inner.lock().await;
        inner.breakers.insert(provider.to_string(), snapshot);
    }

    /// Current live holder token for a lock key.
    pub async fn lock_holder(&self, key: &str) -> Option<String> {
        let inner = self.inner.lock().await;
        inner
            .locks
            .get(key)
            .filter(|(_, expires_at)| *expires_at > Instant::now())
            .map(|(token, _)| token.clone())
    }

    fn check_available(&self) -> Result<(), ConnectorError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ConnectorError::Store(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn get(&self, meeting_id: &MeetingId) -> Result<Option<ConnectorSession>, ConnectorError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        Ok(inner.sessions.get(meeting_id).cloned())
    }

    async fn upsert(&self, session: &ConnectorSession) -> Result<(), ConnectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        inner
            .sessions
            .insert(session.meeting_id.clone(), session.clone());
        Ok(())
    }

    async fn compare_and_update(
        &self,
        session: &ConnectorSession,
        expected_state: SessionState,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool, ConnectorError> {
        self.check_available()?;
        let mut inner = self.inner.lock().await;
        match inner.sessions.get_mut(&session.meeting_id) {
            Some(current)
                if current.state == expected_state
                    && current.updated_at == expected_updated_at =>
            {
                *current = session.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut sessions: Vec<_> = inner.sessions.values().cloned().collect();
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn list_active(&self, limit: usize) -> Result<Vec<ConnectorSession>, ConnectorError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut sessions: Vec<_> = inner
            .sessions
            .values()
            .filter(|s| s.state != SessionState::Disconnected)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        sessions.truncate(limit);
        Ok(sessions)
    }

    async fn count_by_state(&self) -> Result<HashMap<SessionState, i64>, ConnectorError> {
        self.check_available()?;
        let inner = self.inner.lock().await;
        let mut counts = HashMap::new();
        for session in inner.sessions.values() {
            *counts.entry(session.state).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        self.check_available()
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, ConnectorError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        if let Some((_, expires_at)) = inner.locks.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        inner
            .locks
            .insert(key.to_string(), (token.to_string(), now + ttl));
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> Result<bool, ConnectorError> {
        let mut inner = self.inner.lock().await;
        let owned = inner
            .locks
            .get(key)
            .is_some_and(|(holder, expires_at)| holder == token && *expires_at > Instant::now());
        if owned {
            inner.locks.remove(key);
        }
        Ok(owned)
    }

    async fn ping(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
}

#[async_trait]
impl BreakerStore for MemoryStore {
    async fn load(&self, provider: &str) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let inner = self.inner.lock().await;
        Ok(inner.breakers.get(provider).cloned().unwrap_or_default())
    }

    async fn record_success(&self, provider: &str) -> Result<(), ConnectorError> {
        let mut inner = self.inner.lock().await;
        let breaker = inner.breakers.entry(provider.to_string()).or_default();
        if breaker.state == BreakerState::Closed {
            breaker.consecutive_failures = 0;
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        provider: &str,
        reason: &str,
        threshold: u32,
        now: DateTime<Utc>,
    ) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let mut inner = self.inner.lock().await;
        let breaker = inner.breakers.entry(provider.to_string()).or_default();
        breaker.consecutive_failures = breaker.consecutive_failures.saturating_add(1);
        breaker.last_failure_reason = Some(reason.to_string());
        if breaker.state == BreakerState::Closed && breaker.consecutive_failures >= threshold {
            breaker.state = BreakerState::Open;
            breaker.opened_at = DateTime::from_timestamp_millis(now.timestamp_millis());
        }
        Ok(breaker.clone())
    }

    async fn reset(
        &self,
        provider: &str,
        source: ResetSource,
        now: DateTime<Utc>,
        expected_opened_at: Option<DateTime<Utc>>,
    ) -> Result<bool, ConnectorError> {
        let mut inner = self.inner.lock().await;
        let breaker = inner.breakers.entry(provider.to_string()).or_default();
        if let Some(expected) = expected_opened_at {
            let matches = breaker.state == BreakerState::Open
                && breaker.opened_at.map(|t| t.timestamp_millis())
                    == Some(expected.timestamp_millis());
            if !matches {
                return Ok(false);
            }
        }
        let was_open = breaker.state == BreakerState::Open;
        breaker.state = BreakerState::Closed;
        breaker.consecutive_failures = 0;
        breaker.opened_at = None;
        breaker.last_reset_at = DateTime::from_timestamp_millis(now.timestamp_millis());
        breaker.last_reset_source = Some(source);
        Ok(was_open)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::utc_now;

    fn meeting(id: &str) -> MeetingId {
        MeetingId::parse(id).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_expires_after_ttl() {
        let store = MemoryStore::new();
        assert!(store.try_lock("k", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!store.try_lock("k", "b", Duration::from_secs(5)).await.unwrap());

        tokio::time::advance(Duration::from_secs(5)).await;

        assert!(store.try_lock("k", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.lock_holder("k").await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_unlock_requires_matching_token() {
        let store = MemoryStore::new();
        assert!(store.try_lock("k", "a", Duration::from_secs(30)).await.unwrap());
        assert!(!store.unlock("k", "b").await.unwrap());
        assert!(store.unlock("k", "a").await.unwrap());
        assert!(store.lock_holder("k").await.is_none());
    }

    #[tokio::test]
    async fn test_compare_and_update_detects_concurrent_write() {
        let store = MemoryStore::new();
        let now = utc_now();
        let mut session = ConnectorSession::new(meeting("m1"), "sberjazz", now);
        session.state = SessionState::Connected;
        store.upsert(&session).await.unwrap();

        let mut stale = session.clone();
        stale.state = SessionState::Stale;
        stale.updated_at = now + chrono::Duration::seconds(1);

        assert!(!store
            .compare_and_update(&stale, SessionState::Connected, now - chrono::Duration::seconds(1))
            .await
            .unwrap());
        assert!(store
            .compare_and_update(&stale, SessionState::Connected, now)
            .await
            .unwrap());
        assert_eq!(
            store.get(&meeting("m1")).await.unwrap().unwrap().state,
            SessionState::Stale
        );
    }

    #[tokio::test]
    async fn test_list_active_skips_disconnected_oldest_first() {
        let store = MemoryStore::new();
        let now = utc_now();
        for (id, state, age) in [
            ("a", SessionState::Connected, 10),
            ("b", SessionState::Disconnected, 50),
            ("c", SessionState::Failed, 30),
        ] {
            let mut s = ConnectorSession::new(meeting(id), "sberjazz", now);
            s.state = state;
            s.updated_at = now - chrono::Duration::seconds(age);
            store.insert_session(s).await;
        }

        let active = store.list_active(10).await.unwrap();
        let ids: Vec<_> = active.iter().map(|s| s.meeting_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a"]);

        let all = store.list(2).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all.first().unwrap().meeting_id.as_str(), "a");
    }

    #[tokio::test]
    async fn test_breaker_opens_at_threshold_and_success_does_not_close() {
        let store = MemoryStore::new();
        let now = utc_now();
        for _ in 0..2 {
            let snap = store.record_failure("p", "boom", 3, now).await.unwrap();
            assert_eq!(snap.state, BreakerState::Closed);
        }
        let snap = store.record_failure("p", "boom", 3, now).await.unwrap();
        assert_eq!(snap.state, BreakerState::Open);
        assert!(snap.opened_at.is_some());

        store.record_success("p").await.unwrap();
        assert!(store.load("p").await.unwrap().is_open());
    }

    #[tokio::test]
    async fn test_conditional_reset_rejects_reopened_breaker() {
        let store = MemoryStore::new();
        let t1 = utc_now();
        store.record_failure("p", "x", 1, t1).await.unwrap();

        let wrong = t1 - chrono::Duration::seconds(5);
        assert!(!store.reset("p", ResetSource::Auto, t1, Some(wrong)).await.unwrap());
        assert!(store.load("p").await.unwrap().is_open());

        assert!(store.reset("p", ResetSource::Auto, t1, Some(t1)).await.unwrap());
        let snap = store.load("p").await.unwrap();
        assert_eq!(snap.state, BreakerState::Closed);
        assert!(snap.opened_at.is_none());
        assert_eq!(snap.last_reset_source, Some(ResetSource::Auto));
    }

    #[tokio::test]
    async fn test_unavailable_fails_session_calls() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.list_active(10).await,
            Err(ConnectorError::Store(_))
        ));
        store.set_unavailable(false);
        assert!(store.list_active(10).await.unwrap().is_empty());
    }
}
