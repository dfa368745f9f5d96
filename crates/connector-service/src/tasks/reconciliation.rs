//! Reconciliation background task.
//!
//! Each cycle:
//! 1. Marks Connected sessions with an expired heartbeat as Stale, and
//!    Connecting/Reconnecting sessions abandoned by a dead lock holder as Failed
//! 2. Reconnects a bounded batch of Stale/Failed sessions, oldest first
//! 3. Auto-resets the circuit breaker once its cooldown has elapsed
//! 4. Publishes a run summary
//!
//! A failure on one session never aborts the cycle. Only a failure to read
//! the session store fails the cycle; the next interval retries.
//!
//! # Graceful Shutdown
//!
//! The task supports graceful shutdown via a cancellation token. When the token
//! is cancelled, the task completes its current cycle and exits cleanly.

use crate::config::Config;
use crate::errors::ConnectorError;
use crate::models::{
    utc_now, ConnectorSession, ReconciliationRun, RunSource, SessionOutcome, SessionState,
};
use crate::observability::metrics;
use crate::services::{CircuitBreaker, SessionManager};
use crate::store::SessionStore;
use chrono::{DateTime, Utc};
use common::types::MeetingId;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

/// Reconciliation timings and limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    /// Maximum reconnects per cycle.
    pub batch_limit: usize,
    /// Maximum sessions loaded per cycle.
    pub scan_limit: usize,
    /// Heartbeat age after which a Connected session is Stale.
    pub stale_after: Duration,
    /// Age after which an in-flight Connecting/Reconnecting session is abandoned.
    pub abandoned_after: Duration,
}

impl ReconciliationConfig {
    pub fn from_config(config: &Config) -> Self {
        let stale_after = Duration::from_secs(config.reconcile_stale_seconds);
        Self {
            interval: Duration::from_secs(config.reconcile_interval_seconds),
            batch_limit: config.reconcile_limit,
            scan_limit: config.reconcile_scan_limit,
            stale_after,
            abandoned_after: stale_after + config.op_lock_ttl(),
        }
    }
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            batch_limit: 20,
            scan_limit: 2000,
            stale_after: Duration::from_secs(120),
            abandoned_after: Duration::from_secs(180),
        }
    }
}

fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age).map_or(DateTime::<Utc>::MIN_UTC, |age| now - age)
}

fn outcome(meeting_id: &MeetingId, result: &str, error: Option<&ConnectorError>) -> SessionOutcome {
    SessionOutcome {
        meeting_id: meeting_id.clone(),
        result: result.to_string(),
        error: error.map(ToString::to_string),
    }
}

/// Runs reconciliation cycles, either on a timer or on demand.
pub struct ReconciliationWorker {
    manager: Arc<SessionManager>,
    store: Arc<dyn SessionStore>,
    config: ReconciliationConfig,
    /// Serializes cycles started by the timer and by the admin API.
    cycle_guard: Mutex<()>,
}

impl ReconciliationWorker {
    pub fn new(
        manager: Arc<SessionManager>,
        store: Arc<dyn SessionStore>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            manager,
            store,
            config,
            cycle_guard: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    fn breaker(&self) -> &Arc<CircuitBreaker> {
        self.manager.breaker()
    }

    /// Run one cycle now.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the session store cannot be read.
    pub async fn run_cycle(&self, source: RunSource) -> Result<ReconciliationRun, ConnectorError> {
        self.run_cycle_at(source, utc_now()).await
    }

    /// Run one cycle as of `now`.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the session store cannot be read.
    #[instrument(skip_all, fields(source = source.as_str()))]
    pub async fn run_cycle_at(
        &self,
        source: RunSource,
        now: DateTime<Utc>,
    ) -> Result<ReconciliationRun, ConnectorError> {
        let _cycle = self.cycle_guard.lock().await;
        let started = Instant::now();
        let mut run = ReconciliationRun::new(source, now);

        let sessions = match self.store.list_active(self.config.scan_limit).await {
            Ok(sessions) => sessions,
            Err(e) => {
                metrics::record_reconcile_run(source.as_str(), "error");
                error!(
                    target: "connector.task.reconciliation",
                    error = %e,
                    "Reconciliation cycle failed to load sessions"
                );
                return Err(e);
            }
        };
        run.scanned = sessions.len();

        let candidates = self.detect(&sessions, now, &mut run).await;
        self.repair(candidates, &mut run).await;
        self.auto_reset(now, &mut run).await;

        run.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.publish(&run, started.elapsed()).await;
        Ok(run)
    }

    /// Mark stale and abandoned sessions. Returns the repair candidates in
    /// scan order (least recently updated first).
    async fn detect(
        &self,
        sessions: &[ConnectorSession],
        now: DateTime<Utc>,
        run: &mut ReconciliationRun,
    ) -> Vec<MeetingId> {
        let stale_cutoff = cutoff(now, self.config.stale_after);
        let abandoned_cutoff = cutoff(now, self.config.abandoned_after);
        let mut candidates = Vec::new();

        for session in sessions {
            let marked = if session.is_stale_at(stale_cutoff) {
                self.manager
                    .mark_stale(session, now)
                    .await
                    .map(|written| (written, SessionState::Stale))
            } else if session.is_abandoned_at(abandoned_cutoff) {
                self.manager
                    .mark_abandoned(session, now)
                    .await
                    .map(|written| (written, SessionState::Failed))
            } else {
                match session.state {
                    SessionState::Stale => {
                        run.stale_found += 1;
                        candidates.push(session.meeting_id.clone());
                    }
                    SessionState::Failed => candidates.push(session.meeting_id.clone()),
                    _ => {}
                }
                continue;
            };

            match marked {
                Ok((true, SessionState::Stale)) => {
                    run.stale_marked += 1;
                    run.stale_found += 1;
                    candidates.push(session.meeting_id.clone());
                }
                Ok((true, _)) => {
                    run.abandoned_failed += 1;
                    candidates.push(session.meeting_id.clone());
                }
                // Changed since the scan; the next cycle sees the new state
                Ok((false, _)) => {}
                Err(e) => {
                    run.errors += 1;
                    warn!(
                        target: "connector.task.reconciliation",
                        meeting_id = %session.meeting_id,
                        error = %e,
                        "Failed to mark session"
                    );
                }
            }
        }

        candidates
    }

    async fn repair(&self, candidates: Vec<MeetingId>, run: &mut ReconciliationRun) {
        let batch: Vec<MeetingId> = candidates
            .into_iter()
            .take(self.config.batch_limit)
            .collect();
        if batch.is_empty() {
            return;
        }

        let breaker_open = match self.breaker().is_open().await {
            Ok(open) => open,
            Err(e) => {
                run.errors += 1;
                warn!(
                    target: "connector.task.reconciliation",
                    error = %e,
                    "Failed to read circuit breaker, skipping reconnects"
                );
                true
            }
        };
        if breaker_open {
            run.skipped_circuit_open = batch.len();
            info!(
                target: "connector.task.reconciliation",
                skipped = batch.len(),
                "Circuit breaker open, reconnect batch skipped"
            );
            return;
        }

        let mut remaining = batch.iter();
        while let Some(meeting_id) = remaining.next() {
            match self.manager.reconnect(meeting_id).await {
                Ok(_) => {
                    run.reconnect_attempted += 1;
                    run.reconnect_succeeded += 1;
                    run.outcomes.push(outcome(meeting_id, "connected", None));
                }
                Err(e @ ConnectorError::Busy(_)) => {
                    run.skipped_busy += 1;
                    run.outcomes.push(outcome(meeting_id, "busy", Some(&e)));
                }
                Err(e @ (ConnectorError::InvalidState(_) | ConnectorError::NotFound(_))) => {
                    run.outcomes.push(outcome(meeting_id, "skipped", Some(&e)));
                }
                // No external call was made, so this one counts as skipped even
                // though the manager stored it as Failed. The rest stay untouched.
                Err(e @ ConnectorError::CircuitOpen(_)) => {
                    run.skipped_circuit_open += 1 + remaining.len();
                    run.outcomes.push(outcome(meeting_id, "circuit_open", Some(&e)));
                    info!(
                        target: "connector.task.reconciliation",
                        skipped = run.skipped_circuit_open,
                        "Circuit breaker opened mid-batch, remaining reconnects skipped"
                    );
                    break;
                }
                Err(e) => {
                    run.reconnect_attempted += 1;
                    run.reconnect_failed += 1;
                    if matches!(e, ConnectorError::Store(_)) {
                        run.errors += 1;
                    }
                    run.outcomes.push(outcome(meeting_id, "failed", Some(&e)));
                }
            }
        }
    }

    async fn auto_reset(&self, now: DateTime<Utc>, run: &mut ReconciliationRun) {
        if !self.breaker().policy().auto_reset_enabled {
            return;
        }
        match self.breaker().try_auto_reset(now).await {
            Ok(true) => run.breaker_resets += 1,
            Ok(false) => {}
            Err(e) => {
                run.errors += 1;
                warn!(
                    target: "connector.task.reconciliation",
                    error = %e,
                    "Failed to auto-reset circuit breaker"
                );
            }
        }
    }

    async fn publish(&self, run: &ReconciliationRun, duration: Duration) {
        metrics::record_reconcile_run(run.source.as_str(), "success");
        metrics::set_reconcile_last_cycle(
            run.stale_found as u64,
            run.reconnect_failed as u64,
            run.reconnect_succeeded as u64,
            duration,
        );
        self.manager.refresh_session_gauges().await;

        info!(
            target: "connector.task.reconciliation",
            run_id = %run.run_id,
            source = run.source.as_str(),
            scanned = run.scanned,
            stale_marked = run.stale_marked,
            stale_found = run.stale_found,
            abandoned_failed = run.abandoned_failed,
            reconnect_attempted = run.reconnect_attempted,
            reconnect_succeeded = run.reconnect_succeeded,
            reconnect_failed = run.reconnect_failed,
            skipped_busy = run.skipped_busy,
            skipped_circuit_open = run.skipped_circuit_open,
            breaker_resets = run.breaker_resets,
            errors = run.errors,
            duration_ms = run.duration_ms,
            "Reconciliation cycle completed"
        );
    }
}

/// Start the reconciliation background task.
///
/// Runs a cycle every `interval` until the cancellation token is triggered.
/// A cycle in progress when the token fires completes before the task exits.
#[instrument(skip_all, name = "connector.task.reconciliation")]
pub async fn start_reconciliation(
    worker: Arc<ReconciliationWorker>,
    cancel_token: CancellationToken,
) {
    info!(
        target: "connector.task.reconciliation",
        interval_seconds = worker.config.interval.as_secs(),
        batch_limit = worker.config.batch_limit,
        stale_seconds = worker.config.stale_after.as_secs(),
        "Starting reconciliation task"
    );

    let mut interval = tokio::time::interval(worker.config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel_token.cancelled() => {
                info!(
                    target: "connector.task.reconciliation",
                    "Reconciliation task received shutdown signal, exiting"
                );
                break;
            }
            _ = interval.tick() => {
                // Errors are logged inside; the next tick retries
                let _ = worker.run_cycle(RunSource::Job).await;
            }
        }
    }

    info!(
        target: "connector.task.reconciliation",
        "Reconciliation task stopped"
    );
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::models::CircuitBreakerSnapshot;
    use crate::services::circuit_breaker::BreakerPolicy;
    use crate::services::jazz_client::mock::{MockJazzTransport, MockReply};
    use crate::services::jazz_client::JazzOperation;
    use crate::services::{OperationLock, ResilientJazzClient, RetryPolicy};
    use crate::store::memory::MemoryStore;
    use crate::store::LockStore;

    const PROVIDER: &str = "sberjazz";

    struct Fixture {
        worker: Arc<ReconciliationWorker>,
        store: MemoryStore,
        transport: Arc<MockJazzTransport>,
        breaker: Arc<CircuitBreaker>,
    }

    fn fixture(transport: MockJazzTransport, batch_limit: usize) -> Fixture {
        let store = MemoryStore::new();
        let transport = Arc::new(transport);
        let breaker = Arc::new(CircuitBreaker::new(
            PROVIDER,
            Arc::new(store.clone()),
            BreakerPolicy {
                failure_threshold: 3,
                cooldown: Duration::from_secs(60),
                auto_reset_enabled: true,
                auto_reset_min_age: Duration::from_secs(30),
            },
        ));
        let client = Arc::new(ResilientJazzClient::new(
            transport.clone(),
            breaker.clone(),
            RetryPolicy {
                max_retries: 0,
                ..RetryPolicy::default()
            },
        ));
        let lock = OperationLock::new(PROVIDER, Arc::new(store.clone()), Duration::from_secs(60));
        let manager = Arc::new(SessionManager::new(
            PROVIDER,
            Arc::new(store.clone()),
            lock,
            client,
        ));
        let worker = Arc::new(ReconciliationWorker::new(
            manager,
            Arc::new(store.clone()),
            ReconciliationConfig {
                batch_limit,
                ..ReconciliationConfig::default()
            },
        ));
        Fixture {
            worker,
            store,
            transport,
            breaker,
        }
    }

    fn session(id: &str, state: SessionState, heartbeat_secs_ago: i64) -> ConnectorSession {
        let then = utc_now() - chrono::Duration::seconds(heartbeat_secs_ago);
        let mut session = ConnectorSession::new(MeetingId::parse(id).unwrap(), PROVIDER, then);
        session.state = state;
        if state.requires_heartbeat() {
            session.external_session_id = Some(format!("ext-{id}"));
            session.last_heartbeat_at = Some(then);
        }
        session
    }

    async fn stored_state(store: &MemoryStore, id: &str) -> SessionState {
        store
            .get(&MeetingId::parse(id).unwrap())
            .await
            .unwrap()
            .unwrap()
            .state
    }

    #[tokio::test]
    async fn test_stale_session_is_reconnected() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        f.store
            .insert_session(session("m1", SessionState::Connected, 600))
            .await;
        f.store
            .insert_session(session("fresh", SessionState::Connected, 5))
            .await;

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.scanned, 2);
        assert_eq!(run.stale_marked, 1);
        assert_eq!(run.reconnect_attempted, 1);
        assert_eq!(run.reconnect_succeeded, 1);
        assert_eq!(f.transport.calls_for(JazzOperation::Reconnect), 1);
        assert_eq!(stored_state(&f.store, "m1").await, SessionState::Connected);
        assert_eq!(stored_state(&f.store, "fresh").await, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_stale_session_fails_when_reconnect_fails() {
        let f = fixture(MockJazzTransport::failing_with_status(503), 20);
        f.store
            .insert_session(session("m1", SessionState::Connected, 600))
            .await;

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.reconnect_attempted, 1);
        assert_eq!(run.reconnect_failed, 1);
        assert_eq!(run.outcomes[0].result, "failed");
        assert_eq!(stored_state(&f.store, "m1").await, SessionState::Failed);
    }

    #[tokio::test]
    async fn test_batch_limit_bounds_reconnects() {
        let f = fixture(MockJazzTransport::healthy(), 2);
        for i in 0..5 {
            f.store
                .insert_session(session(&format!("m{i}"), SessionState::Stale, 600 - i))
                .await;
        }

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.stale_found, 5);
        assert_eq!(run.reconnect_attempted, 2);
        assert_eq!(f.transport.call_count(), 2);
        // Oldest first
        assert_eq!(run.outcomes[0].meeting_id.as_str(), "m0");
        assert_eq!(run.outcomes[1].meeting_id.as_str(), "m1");
    }

    #[tokio::test]
    async fn test_open_breaker_skips_batch() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        f.store
            .insert_session(session("m1", SessionState::Failed, 600))
            .await;
        for _ in 0..3 {
            f.breaker.record_failure("unavailable").await.unwrap();
        }

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.skipped_circuit_open, 1);
        assert_eq!(run.reconnect_attempted, 0);
        assert_eq!(run.breaker_resets, 0);
        assert_eq!(f.transport.call_count(), 0);
        assert!(f.breaker.is_open().await.unwrap());
    }

    #[tokio::test]
    async fn test_breaker_opening_mid_batch_stops_batch() {
        let f = fixture(MockJazzTransport::failing_with_status(503), 20);
        for i in 0..5 {
            f.store
                .insert_session(session(&format!("m{i}"), SessionState::Stale, 600 - i))
                .await;
        }

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        // Threshold 3: three failed calls open the breaker, the rest are skipped
        assert_eq!(run.reconnect_failed, 3);
        assert_eq!(run.skipped_circuit_open, 2);
        assert_eq!(f.transport.call_count(), 3);
        assert_eq!(run.outcomes[3].result, "circuit_open");
        assert_eq!(stored_state(&f.store, "m3").await, SessionState::Failed);
        assert_eq!(stored_state(&f.store, "m4").await, SessionState::Stale);
    }

    #[tokio::test]
    async fn test_auto_reset_waits_for_cooldown() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        let opened_at = utc_now();
        f.store
            .set_breaker(
                PROVIDER,
                CircuitBreakerSnapshot {
                    state: crate::models::BreakerState::Open,
                    consecutive_failures: 3,
                    opened_at: DateTime::from_timestamp_millis(opened_at.timestamp_millis()),
                    ..CircuitBreakerSnapshot::closed()
                },
            )
            .await;

        let early = f
            .worker
            .run_cycle_at(RunSource::Job, opened_at + chrono::Duration::seconds(45))
            .await
            .unwrap();
        assert_eq!(early.breaker_resets, 0);
        assert!(f.breaker.is_open().await.unwrap());

        let late = f
            .worker
            .run_cycle_at(RunSource::Job, opened_at + chrono::Duration::seconds(61))
            .await
            .unwrap();
        assert_eq!(late.breaker_resets, 1);
        assert!(!f.breaker.is_open().await.unwrap());
    }

    #[tokio::test]
    async fn test_busy_session_is_skipped() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        f.store
            .insert_session(session("m1", SessionState::Stale, 600))
            .await;
        f.store
            .try_lock("connector:sberjazz:lock:m1", "admin", Duration::from_secs(60))
            .await
            .unwrap();

        let run = f.worker.run_cycle(RunSource::Manual).await.unwrap();

        assert_eq!(run.skipped_busy, 1);
        assert_eq!(run.reconnect_attempted, 0);
        assert_eq!(run.reconnect_failed, 0);
        assert_eq!(run.outcomes[0].result, "busy");
    }

    #[tokio::test]
    async fn test_abandoned_connecting_session_is_repaired() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        let mut stuck = session("m1", SessionState::Failed, 600);
        stuck.state = SessionState::Connecting;
        f.store.insert_session(stuck).await;

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.abandoned_failed, 1);
        assert_eq!(run.reconnect_succeeded, 1);
        assert_eq!(f.transport.calls_for(JazzOperation::Join), 1);
        assert_eq!(stored_state(&f.store, "m1").await, SessionState::Connected);
    }

    #[tokio::test]
    async fn test_recent_connecting_session_is_left_alone() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        let mut in_flight = session("m1", SessionState::Failed, 10);
        in_flight.state = SessionState::Connecting;
        f.store.insert_session(in_flight).await;

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.abandoned_failed, 0);
        assert_eq!(f.transport.call_count(), 0);
        assert_eq!(stored_state(&f.store, "m1").await, SessionState::Connecting);
    }

    #[tokio::test]
    async fn test_store_failure_fails_cycle() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        f.store.set_unavailable(true);

        let result = f.worker.run_cycle(RunSource::Job).await;
        assert!(matches!(result, Err(ConnectorError::Store(_))));
    }

    #[tokio::test]
    async fn test_one_bad_session_does_not_abort_cycle() {
        let f = fixture(
            MockJazzTransport::with_replies(vec![MockReply::Status(400)]),
            20,
        );
        f.store
            .insert_session(session("m1", SessionState::Stale, 600))
            .await;
        f.store
            .insert_session(session("m2", SessionState::Stale, 500))
            .await;

        let run = f.worker.run_cycle(RunSource::Job).await.unwrap();

        assert_eq!(run.reconnect_failed, 1);
        assert_eq!(run.reconnect_succeeded, 1);
        assert_eq!(stored_state(&f.store, "m2").await, SessionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_task_exits_on_cancel() {
        let f = fixture(MockJazzTransport::healthy(), 20);
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(start_reconciliation(f.worker.clone(), cancel.clone()));
        tokio::time::advance(Duration::from_secs(65)).await;
        cancel.cancel();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("task should exit after cancel")
            .unwrap();
    }
}
