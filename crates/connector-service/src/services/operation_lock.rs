//! Per-meeting operation lock.
//!
//! Guarantees that at most one join/reconnect/leave runs for a meeting across
//! all service instances. Backed by a shared [`LockStore`]: acquisition is a
//! non-blocking set-if-absent with TTL, release is compare-and-delete on the
//! holder token so an expired holder can never release a successor's lock.

use crate::errors::ConnectorError;
use crate::observability::metrics;
use crate::store::LockStore;
use common::types::MeetingId;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Lock key for a meeting.
pub fn lock_key(provider: &str, meeting_id: &MeetingId) -> String {
    format!("connector:{provider}:lock:{meeting_id}")
}

/// Random 128-bit holder token, hex encoded.
fn generate_token() -> Result<String, ConnectorError> {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 16];
    rng.fill(&mut bytes)
        .map_err(|_| ConnectorError::Internal("Failed to generate lock token".to_string()))?;
    Ok(hex::encode(bytes))
}

/// Lock factory for one provider.
#[derive(Clone)]
pub struct OperationLock {
    provider: String,
    store: Arc<dyn LockStore>,
    ttl: Duration,
}

impl OperationLock {
    pub fn new(provider: &str, store: Arc<dyn LockStore>, ttl: Duration) -> Self {
        Self {
            provider: provider.to_string(),
            store,
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Try to take the lock for `meeting_id` without waiting.
    ///
    /// # Errors
    ///
    /// - `ConnectorError::Busy` if another holder has the lock
    /// - `ConnectorError::Store` if the lock store is unreachable
    pub async fn try_acquire(&self, meeting_id: &MeetingId) -> Result<OperationGuard, ConnectorError> {
        let key = lock_key(&self.provider, meeting_id);
        let token = generate_token()?;

        match self.store.try_lock(&key, &token, self.ttl).await {
            Ok(true) => {
                metrics::record_lock_acquisition("acquired");
                debug!(target: "connector.lock", meeting_id = %meeting_id, "Operation lock acquired");
                Ok(OperationGuard {
                    store: Arc::clone(&self.store),
                    key,
                    token,
                    released: false,
                })
            }
            Ok(false) => {
                metrics::record_lock_acquisition("busy");
                debug!(target: "connector.lock", meeting_id = %meeting_id, "Operation lock busy");
                Err(ConnectorError::Busy(meeting_id.to_string()))
            }
            Err(e) => {
                metrics::record_lock_acquisition("error");
                Err(e)
            }
        }
    }
}

/// Held operation lock.
///
/// Call [`OperationGuard::release`] when the operation finishes. If the guard
/// is dropped unreleased (the operation future was cancelled), release is
/// spawned onto the current runtime; the TTL covers the case where no runtime
/// is available.
pub struct OperationGuard {
    store: Arc<dyn LockStore>,
    key: String,
    token: String,
    released: bool,
}

impl OperationGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Release the lock if this guard still holds it.
    ///
    /// Failures are logged, not returned: the lock expires with its TTL.
    pub async fn release(mut self) {
        self.released = true;
        release_lock(self.store.as_ref(), &self.key, &self.token).await;
    }
}

async fn release_lock(store: &dyn LockStore, key: &str, token: &str) {
    match store.unlock(key, token).await {
        Ok(true) => {}
        Ok(false) => warn!(
            target: "connector.lock",
            key = %key,
            "Operation lock expired before release"
        ),
        Err(e) => warn!(
            target: "connector.lock",
            key = %key,
            error = %e,
            "Failed to release operation lock, relying on TTL"
        ),
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let token = std::mem::take(&mut self.token);
        handle.spawn(async move {
            release_lock(store.as_ref(), &key, &token).await;
        });
    }
}
