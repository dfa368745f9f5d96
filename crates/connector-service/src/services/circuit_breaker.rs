//! Per-connector circuit breaker.
//!
//! State lives in a shared [`BreakerStore`] so every instance sees the same
//! breaker. Only exhausted calls (after retries) count as failures.
//!
//! States: Closed (calls flow, failures counted) and Open (calls rejected
//! locally). Open → Closed happens only through [`CircuitBreaker::reset`]
//! (manual) or [`CircuitBreaker::try_auto_reset`] (reconciliation worker).

use crate::config::Config;
use crate::errors::ConnectorError;
use crate::models::{CircuitBreakerSnapshot, ResetSource};
use crate::observability::metrics;
use crate::store::BreakerStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Reset reason recorded for automatic resets.
pub const AUTO_RESET_REASON: &str = "cooldown_elapsed";

/// Reset reason recorded when a manual reset names none.
pub const DEFAULT_MANUAL_REASON: &str = "manual";

/// Breaker thresholds and timings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerPolicy {
    /// Consecutive exhausted failures that open the breaker.
    pub failure_threshold: u32,
    /// Minimum time Open before an automatic reset.
    pub cooldown: Duration,
    pub auto_reset_enabled: bool,
    /// Additional floor on breaker age before an automatic reset.
    pub auto_reset_min_age: Duration,
}

impl BreakerPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            failure_threshold: config.cb_failure_threshold,
            cooldown: Duration::from_secs(config.cb_open_seconds),
            auto_reset_enabled: config.cb_auto_reset_enabled,
            auto_reset_min_age: Duration::from_secs(config.cb_auto_reset_min_age_seconds),
        }
    }

    /// Age an Open breaker must reach before automatic reset.
    pub fn auto_reset_after(&self) -> Duration {
        self.cooldown.max(self.auto_reset_min_age)
    }
}

impl Default for BreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(60),
            auto_reset_enabled: true,
            auto_reset_min_age: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker for one provider.
pub struct CircuitBreaker {
    provider: String,
    store: Arc<dyn BreakerStore>,
    policy: BreakerPolicy,
}

impl CircuitBreaker {
    pub fn new(provider: &str, store: Arc<dyn BreakerStore>, policy: BreakerPolicy) -> Self {
        Self {
            provider: provider.to_string(),
            store,
            policy,
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn policy(&self) -> &BreakerPolicy {
        &self.policy
    }

    /// Current shared breaker state.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    pub async fn snapshot(&self) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let snapshot = self.store.load(&self.provider).await?;
        metrics::set_circuit_breaker_open(snapshot.is_open());
        Ok(snapshot)
    }

    /// Whether calls must be rejected locally.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    pub async fn is_open(&self) -> Result<bool, ConnectorError> {
        Ok(self.snapshot().await?.is_open())
    }

    /// Clear the consecutive failure count. No effect while Open.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    pub async fn record_success(&self) -> Result<(), ConnectorError> {
        self.store.record_success(&self.provider).await
    }

    /// Count one exhausted call failure, opening the breaker at the threshold.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    #[instrument(skip_all, fields(provider = %self.provider))]
    pub async fn record_failure(
        &self,
        reason: &str,
    ) -> Result<CircuitBreakerSnapshot, ConnectorError> {
        let now = Utc::now();
        let snapshot = self
            .store
            .record_failure(&self.provider, reason, self.policy.failure_threshold, now)
            .await?;

        let opened_now = snapshot
            .opened_at
            .is_some_and(|t| t.timestamp_millis() == now.timestamp_millis());
        if opened_now {
            warn!(
                target: "connector.circuit_breaker",
                provider = %self.provider,
                consecutive_failures = snapshot.consecutive_failures,
                reason = %reason,
                "Circuit breaker opened"
            );
        }

        metrics::set_circuit_breaker_open(snapshot.is_open());
        metrics::set_connector_health(!snapshot.is_open());
        Ok(snapshot)
    }

    /// Force the breaker Closed. Returns whether an Open breaker was closed.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    #[instrument(skip_all, fields(provider = %self.provider, source = source.as_str()))]
    pub async fn reset(&self, source: ResetSource, reason: &str) -> Result<bool, ConnectorError> {
        let was_open = self
            .store
            .reset(&self.provider, source, Utc::now(), None)
            .await?;
        self.after_reset(source, reason, was_open);
        Ok(was_open)
    }

    /// Whether `snapshot` is Open long enough for an automatic reset.
    pub fn auto_reset_due(&self, snapshot: &CircuitBreakerSnapshot, now: DateTime<Utc>) -> bool {
        if !self.policy.auto_reset_enabled || !snapshot.is_open() {
            return false;
        }
        let Some(opened_at) = snapshot.opened_at else {
            return false;
        };
        let Ok(min_age) = chrono::Duration::from_std(self.policy.auto_reset_after()) else {
            return false;
        };
        now - opened_at >= min_age
    }

    /// Reset the breaker automatically if it is due.
    ///
    /// The reset is conditioned on the `opened_at` observed here, so a breaker
    /// that re-opened concurrently keeps its new cooldown.
    ///
    /// # Errors
    ///
    /// Returns `ConnectorError::Store` if the breaker store is unreachable.
    pub async fn try_auto_reset(&self, now: DateTime<Utc>) -> Result<bool, ConnectorError> {
        let snapshot = self.store.load(&self.provider).await?;
        if !self.auto_reset_due(&snapshot, now) {
            return Ok(false);
        }

        let reset = self
            .store
            .reset(&self.provider, ResetSource::Auto, now, snapshot.opened_at)
            .await?;
        if reset {
            self.after_reset(ResetSource::Auto, AUTO_RESET_REASON, true);
        }
        Ok(reset)
    }

    fn after_reset(&self, source: ResetSource, reason: &str, was_open: bool) {
        metrics::record_breaker_reset(source.as_str(), reason);
        metrics::set_circuit_breaker_open(false);
        metrics::set_connector_health(true);

        info!(
            target: "connector.circuit_breaker",
            provider = %self.provider,
            source = source.as_str(),
            reason = %reason,
            was_open = was_open,
            "Circuit breaker reset"
        );
    }
}
