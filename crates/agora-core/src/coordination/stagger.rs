//! Staggered sequential execution of batched operations.
//!
//! Contention against an optimistic-concurrency store is worst when a
//! burst of writes lands at once. The scheduler runs a batch strictly in
//! order, one operation at a time, with a fixed delay between successive
//! completions. That trades throughput for a lower collision probability,
//! which is the actual objective at the single-digit batch sizes the
//! domain produces.

use std::time::Duration;

use futures::future::BoxFuture;

use crate::error::Result;

/// Default gap between successive batch operations.
pub const DEFAULT_STAGGER_DELAY: Duration = Duration::from_millis(100);

/// Executes ordered batches with a fixed inter-operation delay.
#[derive(Debug, Clone, Copy)]
pub struct StaggeredScheduler {
    delay: Duration,
}

impl Default for StaggeredScheduler {
    fn default() -> Self {
        Self {
            delay: DEFAULT_STAGGER_DELAY,
        }
    }
}

impl StaggeredScheduler {
    /// Create a scheduler with a custom inter-operation delay.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }

    /// The configured inter-operation delay.
    #[must_use]
    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Run the batch with this scheduler's delay. See
    /// [`run_staggered_batch`].
    pub async fn run<T>(&self, operations: Vec<BoxFuture<'_, Result<T>>>) -> Result<Vec<T>> {
        run_staggered_batch(operations, self.delay).await
    }
}

/// Execute `operations` strictly in order, awaiting each one and sleeping
/// `delay` between successive completions.
///
/// Returns the ordered results. The first error aborts the batch
/// immediately: operations not yet run are dropped unexecuted and partial
/// results are discarded. Futures are lazy, so a dropped operation has
/// performed no work.
pub async fn run_staggered_batch<T>(
    operations: Vec<BoxFuture<'_, Result<T>>>,
    delay: Duration,
) -> Result<Vec<T>> {
    let total = operations.len();
    let mut results = Vec::with_capacity(total);

    for (index, operation) in operations.into_iter().enumerate() {
        if index > 0 {
            tokio::time::sleep(delay).await;
        }
        match operation.await {
            Ok(value) => results.push(value),
            Err(err) => {
                tracing::debug!(
                    completed = index,
                    total,
                    error = %err,
                    "staggered batch aborted"
                );
                return Err(err);
            }
        }
    }

    Ok(results)
}
