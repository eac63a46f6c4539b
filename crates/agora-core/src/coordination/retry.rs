//! Bounded retry with exponential backoff and jitter.
//!
//! Every store mutation in the crate funnels through [`RetryCoordinator`]:
//! transient contention (aborted transactions, stale preconditions,
//! unavailability) is absorbed up to an attempt budget, permanent errors
//! propagate untouched on the first attempt, and exhaustion surfaces as
//! [`Error::RetryExhausted`] wrapping the last transient failure.
//!
//! The coordinator bounds attempt count, not wall-clock time: a slow but
//! eventually successful sequence of attempts is never cancelled.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{Error, Result};

/// Default attempt budget for transactional operations.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Base backoff per 0-indexed failed attempt, in milliseconds. Attempts
/// beyond the table reuse the last entry.
pub const BACKOFF_TABLE_MS: [u64; 5] = [100, 300, 700, 1500, 3000];

/// Upper bound (exclusive) of the uniform jitter added to every backoff.
const DEFAULT_JITTER_MS: u64 = 100;

/// Backoff configuration for [`RetryCoordinator`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    table_ms: Vec<u64>,
    jitter_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            table_ms: BACKOFF_TABLE_MS.to_vec(),
            jitter_ms: DEFAULT_JITTER_MS,
        }
    }
}

impl RetryPolicy {
    /// Create the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the backoff table. Empty input keeps the default table.
    #[must_use]
    pub fn with_table_ms(mut self, table_ms: Vec<u64>) -> Self {
        if !table_ms.is_empty() {
            self.table_ms = table_ms;
        }
        self
    }

    /// Set the exclusive upper bound of the uniform jitter. Zero disables
    /// jitter.
    #[must_use]
    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = jitter_ms;
        self
    }

    /// Compute the delay to wait after the 0-indexed failed attempt.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let index = (attempt as usize).min(self.table_ms.len() - 1);
        let base = self.table_ms[index];
        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..self.jitter_ms)
        };
        Duration::from_millis(base + jitter)
    }
}

/// Re-executes failed operations under a bounded backoff policy.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    /// Create a coordinator with the default policy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a coordinator with a custom policy.
    #[must_use]
    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `operation`, retrying transient failures up to `max_attempts`
    /// total attempts.
    ///
    /// The operation may run more than once; producers that touch
    /// non-transactional state must themselves be safe to repeat. `name`
    /// appears in log events only and never influences control flow.
    pub async fn run<T, F, Fut>(&self, name: &str, max_attempts: u32, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        tracing::debug!(
                            operation = name,
                            attempt = attempt + 1,
                            "operation succeeded after retry"
                        );
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    attempt += 1;
                    if attempt >= max_attempts {
                        tracing::warn!(
                            operation = name,
                            attempts = max_attempts,
                            error = %err,
                            "retry budget exhausted"
                        );
                        return Err(match err {
                            Error::Store(source) => Error::RetryExhausted {
                                operation: name.to_string(),
                                attempts: max_attempts,
                                source,
                            },
                            other => other,
                        });
                    }
                    let delay = self.policy.delay_for(attempt - 1);
                    tracing::debug!(
                        operation = name,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying after transient failure"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::StoreError;

    fn aborted() -> Error {
        Error::Store(StoreError::Aborted("doc changed".into()))
    }

    fn permanent() -> Error {
        Error::Store(StoreError::PermissionDenied("no access".into()))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let coordinator = RetryCoordinator::new();
        let attempts = AtomicU32::new(0);

        let result = coordinator
            .run("op", 5, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(7) }
            })
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_failures_until_success() {
        let coordinator =
            RetryCoordinator::with_policy(RetryPolicy::new().with_table_ms(vec![1]).with_jitter_ms(0));
        let attempts = AtomicU32::new(0);

        let result = coordinator
            .run("op", 5, || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(aborted())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_error_causes_exactly_one_attempt() {
        let coordinator = RetryCoordinator::new();
        let attempts = AtomicU32::new(0);

        let result: Result<()> = coordinator
            .run("op", 5, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(permanent()) }
            })
            .await;

        assert!(matches!(
            result.unwrap_err(),
            Error::Store(StoreError::PermissionDenied(_))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_budget_and_last_error() {
        let coordinator =
            RetryCoordinator::with_policy(RetryPolicy::new().with_table_ms(vec![1]).with_jitter_ms(0));
        let attempts = AtomicU32::new(0);

        let result: Result<()> = coordinator
            .run("market:update:widget", 3, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(aborted()) }
            })
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            Error::RetryExhausted {
                operation,
                attempts,
                source,
            } => {
                assert_eq!(operation, "market:update:widget");
                assert_eq!(attempts, 3);
                assert!(matches!(source, StoreError::Aborted(_)));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn zero_attempt_budget_still_runs_once() {
        let coordinator = RetryCoordinator::new();
        let attempts = AtomicU32::new(0);

        let result = coordinator
            .run("op", 0, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, Error>(()) }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn delay_follows_table_with_bounded_jitter() {
        let policy = RetryPolicy::new();
        for attempt in 0..8_u32 {
            let base = BACKOFF_TABLE_MS[(attempt as usize).min(4)];
            for _ in 0..32 {
                let delay = policy.delay_for(attempt).as_millis() as u64;
                assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
                assert!(delay < base + 100, "attempt {attempt}: {delay} >= {}", base + 100);
            }
        }
    }

    #[test]
    fn base_backoff_sequence_is_non_decreasing() {
        for window in BACKOFF_TABLE_MS.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    #[test]
    fn jitter_can_be_disabled() {
        let policy = RetryPolicy::new().with_jitter_ms(0);
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(9), Duration::from_millis(3000));
    }
}
