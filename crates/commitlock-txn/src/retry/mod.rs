//! Caller-side retry of whole transactions.
//!
//! Lock and version failures at vote time are retryable: the transaction
//! is aborted and run again from the start. [`run_with_retry`] does this
//! with exponential backoff and random jitter so that two transactions
//! that just deadlocked don't collide again in lockstep.

use std::thread;
use std::time::Duration;

use commitlock_common::types::TxnId;
use commitlock_common::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BACKOFF_MS, DEFAULT_RETRY_MAX_BACKOFF_MS};
use rand::Rng;
use tracing::{debug, warn};

use crate::coordinator::CommitCoordinator;
use crate::error::{CommitLockError, TxnResult};

/// When and how often to re-run a failed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts in total, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
    /// Whether stale reads are retried too. A caller that can refresh its
    /// view should handle them itself instead.
    pub retry_read_conflicts: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_ATTEMPTS,
            initial_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            max_backoff: Duration::from_millis(DEFAULT_RETRY_MAX_BACKOFF_MS),
            retry_read_conflicts: true,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn never() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Returns true if `error` on attempt `attempt` (1-based) should be retried.
    pub fn should_retry(&self, error: &CommitLockError, attempt: u32) -> bool {
        if attempt >= self.max_attempts || !error.is_retryable() {
            return false;
        }
        self.retry_read_conflicts || !error.is_stale_read()
    }

    /// Returns the sleep before attempt `attempt + 1`.
    ///
    /// The exponential base is capped at `max_backoff`; the result is drawn
    /// uniformly from its upper half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let nanos = u64::try_from(base.as_nanos()).unwrap_or(u64::MAX);
        if nanos < 2 {
            return base;
        }
        Duration::from_nanos(rand::thread_rng().gen_range(nanos / 2..=nanos))
    }
}

/// Runs `body` in a fresh transaction until it succeeds or fails for good.
///
/// `body` records stores and assertions, then usually votes and finishes.
/// A transaction whose body fails is always aborted before the error is
/// retried or returned. Records of attempts that ended are forgotten; a
/// transaction the body left open stays with the caller.
pub fn run_with_retry<T, F>(
    coordinator: &CommitCoordinator,
    policy: &RetryPolicy,
    mut body: F,
) -> TxnResult<T>
where
    F: FnMut(&CommitCoordinator, TxnId) -> TxnResult<T>,
{
    let mut attempt = 1;
    loop {
        let txn_id = coordinator.begin()?;
        let error = match body(coordinator, txn_id) {
            Ok(value) => {
                coordinator.forget(txn_id);
                return Ok(value);
            }
            Err(e) => e,
        };
        coordinator.abort(txn_id);
        coordinator.forget(txn_id);

        if !policy.should_retry(&error, attempt) {
            if error.is_retryable() {
                warn!(txn_id = %txn_id, attempt, error = %error, "giving up on transaction");
            }
            return Err(error);
        }

        let pause = policy.backoff(attempt);
        debug!(
            txn_id = %txn_id,
            attempt,
            backoff_ms = pause.as_millis() as u64,
            error = %error,
            "retrying transaction"
        );
        thread::sleep(pause);
        attempt += 1;
    }
}
