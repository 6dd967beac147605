//! Optimistic-concurrency retry loop
//!
//! Account writes never block each other on a lock held across I/O. A
//! writer reads the account, prepares its change and commits only if the
//! version is unchanged; on `VersionConflict` the guard backs off and runs
//! the whole read-prepare-commit step again.

use crate::{config::RetryConfig, metrics::Metrics, types::AccountId, Error, Result};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

/// Bounded exponential backoff with full jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts including the first
    pub max_attempts: u32,
    /// Backoff floor
    pub base_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_backoff: Duration::from_millis(config.base_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = self
            .base_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);
        if ceiling <= self.base_backoff {
            return ceiling;
        }
        rand::thread_rng().gen_range(self.base_backoff..=ceiling)
    }
}

/// Retries account mutations that lose the version race
#[derive(Debug)]
pub struct ConsistencyGuard {
    policy: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl ConsistencyGuard {
    /// Create a guard
    pub fn new(policy: RetryPolicy, metrics: Arc<Metrics>) -> Self {
        Self { policy, metrics }
    }

    /// Run `attempt` until it stops failing with `VersionConflict`.
    ///
    /// Each call must re-read the account. After `max_attempts` conflicts
    /// the guard gives up with `ConcurrencyExhausted`.
    pub async fn run<T, F>(&self, account_id: AccountId, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match attempt() {
                Err(Error::VersionConflict { expected, actual, .. }) => {
                    self.metrics.record_version_conflict();

                    if attempts >= self.policy.max_attempts {
                        self.metrics.record_concurrency_exhausted();
                        tracing::warn!(
                            account_id = %account_id,
                            attempts,
                            "Retries exhausted on contended account"
                        );
                        return Err(Error::ConcurrencyExhausted { account_id, attempts });
                    }

                    let delay = self.policy.backoff(attempts);
                    tracing::debug!(
                        account_id = %account_id,
                        attempt = attempts,
                        expected,
                        actual,
                        delay_ms = delay.as_millis() as u64,
                        "Version conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }
}
