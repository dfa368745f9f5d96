//! Resilient external API client.
//!
//! Wraps a [`JazzTransport`] with:
//! - a circuit breaker gate checked before any network call
//! - bounded retries with linear backoff for transient failures
//! - exactly one breaker outcome per logical call (never per attempt)
//! - a bounded window of recent call outcomes for the health endpoint

use crate::config::Config;
use crate::errors::{ConnectorError, ExternalErrorKind};
use crate::observability::metrics;
use crate::services::circuit_breaker::CircuitBreaker;
use crate::services::jazz_client::{
    AttemptError, JazzOperation, JazzRequest, JazzTransport, JoinResult,
};
use common::types::MeetingId;
use serde_json::Value;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Number of recent call outcomes kept for the error rate.
pub const RECENT_WINDOW: usize = 50;

/// Retry settings for outbound calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub retryable_statuses: BTreeSet<u16>,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.http_retries,
            backoff_base: Duration::from_millis(config.retry_backoff_ms),
            backoff_cap: Duration::from_millis(config.retry_backoff_cap_ms),
            retryable_statuses: config.retry_statuses.clone(),
        }
    }

    /// Total attempts for one logical call.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base: Duration::from_millis(300),
            backoff_cap: Duration::from_millis(5000),
            retryable_statuses: [408, 409, 425, 429, 500, 502, 503, 504].into_iter().collect(),
        }
    }
}

/// Delay before the retry that follows failed attempt `attempt` (1-based):
/// `min(base * attempt, cap)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    policy
        .backoff_base
        .saturating_mul(attempt)
        .min(policy.backoff_cap)
}

/// How one attempt's result affects the retry loop.
#[derive(Debug)]
pub enum AttemptOutcome {
    Success(Value),
    /// Worth another attempt if any remain.
    Retryable(AttemptError),
    /// Stop now.
    Fatal(AttemptError),
}

impl AttemptOutcome {
    fn label(&self) -> &'static str {
        match self {
            AttemptOutcome::Success(_) => "success",
            AttemptOutcome::Retryable(_) => "retryable",
            AttemptOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Classify one attempt.
///
/// Auth failures are never retried. Statuses in the retryable set, timeouts
/// and connect failures are retried. Everything else is final.
pub fn classify_attempt(policy: &RetryPolicy, result: Result<Value, AttemptError>) -> AttemptOutcome {
    match result {
        Ok(value) => AttemptOutcome::Success(value),
        Err(err) => {
            let retryable = match &err {
                AttemptError::Status { status, .. } => {
                    ExternalErrorKind::from_status(*status) != ExternalErrorKind::Auth
                        && policy.retryable_statuses.contains(status)
                }
                AttemptError::Transport { kind, .. } => {
                    matches!(kind, ExternalErrorKind::Timeout | ExternalErrorKind::Unavailable)
                }
                AttemptError::NotConfigured | AttemptError::InvalidBody { .. } => false,
            };
            if retryable {
                AttemptOutcome::Retryable(err)
            } else {
                AttemptOutcome::Fatal(err)
            }
        }
    }
}

/// External API client with retry, backoff and breaker gating.
pub struct ResilientJazzClient {
    transport: Arc<dyn JazzTransport>,
    breaker: Arc<CircuitBreaker>,
    policy: RetryPolicy,
    recent: Mutex<VecDeque<bool>>,
}

impl ResilientJazzClient {
    pub fn new(
        transport: Arc<dyn JazzTransport>,
        breaker: Arc<CircuitBreaker>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            transport,
            breaker,
            policy,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_WINDOW)),
        }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Join the meeting.
    ///
    /// # Errors
    ///
    /// - `ConnectorError::CircuitOpen` if the breaker is Open (no call made)
    /// - `ConnectorError::ExternalApi` if the call failed after retries
    /// - `ConnectorError::Store` if the breaker state cannot be read
    pub async fn join(&self, meeting_id: &MeetingId) -> Result<JoinResult, ConnectorError> {
        let data = self.execute(JazzRequest::join(meeting_id)).await?;
        Ok(JoinResult::from_response(meeting_id, &data))
    }

    /// Resume an existing external session.
    ///
    /// # Errors
    ///
    /// Same as [`ResilientJazzClient::join`].
    pub async fn reconnect(
        &self,
        meeting_id: &MeetingId,
        external_session_id: &str,
    ) -> Result<JoinResult, ConnectorError> {
        let data = self
            .execute(JazzRequest::reconnect(meeting_id, external_session_id))
            .await?;
        Ok(JoinResult::from_response(meeting_id, &data))
    }

    /// Leave the meeting.
    ///
    /// # Errors
    ///
    /// Same as [`ResilientJazzClient::join`].
    pub async fn leave(
        &self,
        meeting_id: &MeetingId,
        external_session_id: Option<&str>,
    ) -> Result<(), ConnectorError> {
        self.execute(JazzRequest::leave(meeting_id, external_session_id))
            .await
            .map(|_| ())
    }

    /// Single-attempt reachability probe.
    ///
    /// Returns `Ok(None)` without a network call while the breaker is Open.
    /// The outcome never touches the breaker or the recent-call window.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker state cannot be read.
    pub async fn probe_health(&self) -> Result<Option<bool>, ConnectorError> {
        if self.breaker.is_open().await? {
            return Ok(None);
        }

        let request = JazzRequest::health();
        let start = Instant::now();
        let outcome = classify_attempt(&self.policy, self.transport.send(&request).await);
        metrics::record_http_attempt(request.operation.as_str(), outcome.label(), start.elapsed());

        match outcome {
            AttemptOutcome::Success(_) => Ok(Some(true)),
            AttemptOutcome::Retryable(err) | AttemptOutcome::Fatal(err) => {
                debug!(
                    target: "connector.resilience",
                    kind = err.kind().as_str(),
                    "Health probe failed"
                );
                Ok(Some(false))
            }
        }
    }

    /// Failure ratio over the recent call window, and the window size.
    pub fn recent_error_rate(&self) -> (f64, usize) {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let total = recent.len();
        if total == 0 {
            return (0.0, 0);
        }
        let failures = recent.iter().filter(|ok| !**ok).count();
        #[allow(clippy::cast_precision_loss)]
        let rate = failures as f64 / total as f64;
        (rate, total)
    }

    fn record_recent(&self, ok: bool) {
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() == RECENT_WINDOW {
            recent.pop_front();
        }
        recent.push_back(ok);
    }

    #[instrument(skip_all, fields(operation = request.operation.as_str()))]
    async fn execute(&self, request: JazzRequest) -> Result<Value, ConnectorError> {
        let operation = request.operation;

        if self.breaker.is_open().await? {
            debug!(
                target: "connector.resilience",
                operation = operation.as_str(),
                "Circuit breaker open, call rejected locally"
            );
            return Err(ConnectorError::CircuitOpen(
                self.breaker.provider().to_string(),
            ));
        }

        let max_attempts = self.policy.max_attempts();
        let mut attempt = 1;
        let final_error = loop {
            let start = Instant::now();
            let outcome = classify_attempt(&self.policy, self.transport.send(&request).await);
            metrics::record_http_attempt(operation.as_str(), outcome.label(), start.elapsed());

            match outcome {
                AttemptOutcome::Success(value) => {
                    self.on_success(operation).await;
                    return Ok(value);
                }
                AttemptOutcome::Retryable(err) if attempt < max_attempts => {
                    let delay = backoff_delay(&self.policy, attempt);
                    warn!(
                        target: "connector.resilience",
                        operation = operation.as_str(),
                        attempt = attempt,
                        max_attempts = max_attempts,
                        kind = err.kind().as_str(),
                        status = ?err.status(),
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "External API attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                AttemptOutcome::Retryable(err) | AttemptOutcome::Fatal(err) => break err,
            }
        };

        let error = final_error.into_connector_error();
        self.on_failure(operation, attempt, &error).await;
        Err(error)
    }

    async fn on_success(&self, operation: JazzOperation) {
        self.record_recent(true);
        if let Err(e) = self.breaker.record_success().await {
            warn!(
                target: "connector.resilience",
                operation = operation.as_str(),
                error = %e,
                "Failed to record breaker success"
            );
        }
    }

    async fn on_failure(&self, operation: JazzOperation, attempts: u32, error: &ConnectorError) {
        self.record_recent(false);

        let reason = match error {
            ConnectorError::ExternalApi {
                kind,
                status: Some(status),
                ..
            } => format!("{kind}: HTTP {status}"),
            ConnectorError::ExternalApi { kind, .. } => kind.to_string(),
            other => other.code().to_string(),
        };

        warn!(
            target: "connector.resilience",
            operation = operation.as_str(),
            attempts = attempts,
            reason = %reason,
            "External API call failed"
        );

        if let Err(e) = self.breaker.record_failure(&reason).await {
            warn!(
                target: "connector.resilience",
                operation = operation.as_str(),
                error = %e,
                "Failed to record breaker failure"
            );
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::services::circuit_breaker::BreakerPolicy;
    use crate::services::jazz_client::mock::{MockJazzTransport, MockReply};
    use crate::store::memory::MemoryStore;

    fn meeting() -> MeetingId {
        MeetingId::parse("m-1").unwrap()
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            ..RetryPolicy::default()
        }
    }

    fn client(
        transport: MockJazzTransport,
        threshold: u32,
    ) -> (ResilientJazzClient, Arc<MockJazzTransport>, Arc<CircuitBreaker>) {
        let transport = Arc::new(transport);
        let breaker = Arc::new(CircuitBreaker::new(
            "sberjazz",
            Arc::new(MemoryStore::new()),
            BreakerPolicy {
                failure_threshold: threshold,
                ..BreakerPolicy::default()
            },
        ));
        let client = ResilientJazzClient::new(transport.clone(), breaker.clone(), fast_policy());
        (client, transport, breaker)
    }

    #[test]
    fn test_backoff_is_linear_and_capped() {
        let policy = RetryPolicy {
            backoff_base: Duration::from_millis(300),
            backoff_cap: Duration::from_millis(700),
            ..RetryPolicy::default()
        };
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(300));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_millis(600));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(700));
    }

    #[test]
    fn test_classify_attempt() {
        let policy = RetryPolicy::default();
        let status = |status| {
            classify_attempt(
                &policy,
                Err(AttemptError::Status {
                    status,
                    body: String::new(),
                }),
            )
        };

        assert!(matches!(status(503), AttemptOutcome::Retryable(_)));
        assert!(matches!(status(429), AttemptOutcome::Retryable(_)));
        assert!(matches!(status(401), AttemptOutcome::Fatal(_)));
        assert!(matches!(status(403), AttemptOutcome::Fatal(_)));
        assert!(matches!(status(400), AttemptOutcome::Fatal(_)));
        // 5xx outside the configured set is final
        assert!(matches!(status(501), AttemptOutcome::Fatal(_)));

        let transport = |kind| {
            classify_attempt(
                &policy,
                Err(AttemptError::Transport {
                    kind,
                    detail: String::new(),
                }),
            )
        };
        assert!(matches!(transport(ExternalErrorKind::Timeout), AttemptOutcome::Retryable(_)));
        assert!(matches!(transport(ExternalErrorKind::Unavailable), AttemptOutcome::Retryable(_)));
        assert!(matches!(transport(ExternalErrorKind::Provider), AttemptOutcome::Fatal(_)));

        assert!(matches!(
            classify_attempt(&policy, Err(AttemptError::NotConfigured)),
            AttemptOutcome::Fatal(_)
        ));
    }

    #[test]
    fn test_auth_is_fatal_even_if_listed_retryable() {
        let mut policy = RetryPolicy::default();
        policy.retryable_statuses.insert(401);
        let outcome = classify_attempt(
            &policy,
            Err(AttemptError::Status {
                status: 401,
                body: String::new(),
            }),
        );
        assert!(matches!(outcome, AttemptOutcome::Fatal(_)));
    }

    #[tokio::test]
    async fn test_retryable_failures_exhaust_then_one_breaker_failure() {
        let (client, transport, breaker) = client(MockJazzTransport::failing_with_status(503), 5);

        let err = client.join(&meeting()).await.unwrap_err();

        assert_eq!(transport.call_count(), 3);
        assert!(matches!(
            err,
            ConnectorError::ExternalApi {
                kind: ExternalErrorKind::Unavailable,
                status: Some(503),
                ..
            }
        ));
        assert_eq!(breaker.snapshot().await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_success_after_retry_records_success() {
        let (client, transport, breaker) = client(
            MockJazzTransport::with_replies(vec![MockReply::Timeout, MockReply::Status(502)]),
            5,
        );

        let result = client.join(&meeting()).await.unwrap();

        assert_eq!(transport.call_count(), 3);
        assert_eq!(result.external_session_id, "jazz-m-1");
        assert_eq!(breaker.snapshot().await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn test_auth_failure_is_not_retried() {
        let (client, transport, _) = client(MockJazzTransport::failing_with_status(401), 5);

        let err = client.join(&meeting()).await.unwrap_err();

        assert_eq!(transport.call_count(), 1);
        assert!(matches!(
            err,
            ConnectorError::ExternalApi {
                kind: ExternalErrorKind::Auth,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_short_circuits() {
        let (client, transport, breaker) = client(MockJazzTransport::failing_with_status(503), 1);

        client.join(&meeting()).await.unwrap_err();
        assert!(breaker.is_open().await.unwrap());
        let calls = transport.call_count();

        let err = client.reconnect(&meeting(), "ext").await.unwrap_err();
        assert!(matches!(err, ConnectorError::CircuitOpen(_)));
        assert_eq!(transport.call_count(), calls);
    }

    #[tokio::test]
    async fn test_health_probe_does_not_touch_breaker() {
        let (client, transport, breaker) = client(MockJazzTransport::unreachable(), 1);

        assert_eq!(client.probe_health().await.unwrap(), Some(false));
        assert_eq!(transport.call_count(), 1);
        assert!(!breaker.is_open().await.unwrap());
        assert_eq!(client.recent_error_rate(), (0.0, 0));
    }

    #[tokio::test]
    async fn test_health_probe_skipped_while_open() {
        let (client, transport, breaker) = client(MockJazzTransport::healthy(), 1);
        breaker.record_failure("unavailable").await.unwrap();

        assert_eq!(client.probe_health().await.unwrap(), None);
        assert_eq!(transport.call_count(), 0);
    }

    #[tokio::test]
    async fn test_recent_error_rate_window() {
        let (client, _, _) = client(
            MockJazzTransport::with_replies(vec![MockReply::Status(400)]),
            100,
        );

        client.join(&meeting()).await.unwrap_err();
        client.join(&meeting()).await.unwrap();
        assert_eq!(client.recent_error_rate(), (0.5, 2));

        for _ in 0..RECENT_WINDOW {
            client.join(&meeting()).await.unwrap();
        }
        assert_eq!(client.recent_error_rate(), (0.0, RECENT_WINDOW));
    }
}
