//! Conflict-safe write primitives.
//!
//! [`ConflictSafeWriter`] is the only path through which domain code
//! mutates the store. Plain writes get a small retry budget; transactions
//! get a larger one, because optimistic transactions are the primary
//! correctness mechanism and are expected to abort under contention.
//! Callers observe only permanent errors or retry exhaustion — transient
//! contention never escapes this module.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::retry::{RetryCoordinator, DEFAULT_MAX_ATTEMPTS};
use crate::error::{Error, Result};
use crate::store::{DocRef, DocumentStore, SetOptions, Transaction};

/// Attempt budget for plain update/set writes.
const WRITE_MAX_ATTEMPTS: u32 = 3;

/// Attempt budget for transactions.
const TRANSACTION_MAX_ATTEMPTS: u32 = DEFAULT_MAX_ATTEMPTS;

/// Update/set/transaction primitives, each routed through the retry layer.
#[derive(Clone)]
pub struct ConflictSafeWriter {
    store: Arc<dyn DocumentStore>,
    retry: RetryCoordinator,
}

impl ConflictSafeWriter {
    /// Create a writer over the given store with the default retry policy.
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            retry: RetryCoordinator::new(),
        }
    }

    /// Create a writer with a custom retry coordinator.
    #[must_use]
    pub fn with_retry(store: Arc<dyn DocumentStore>, retry: RetryCoordinator) -> Self {
        Self { store, retry }
    }

    /// The underlying store handle.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Merge fields into an existing document, absorbing transient
    /// failures.
    pub async fn safe_update(&self, doc: &DocRef, fields: Value) -> Result<()> {
        let name = format!("update:{doc}");
        self.retry
            .run(&name, WRITE_MAX_ATTEMPTS, || {
                let fields = fields.clone();
                async move { self.store.update(doc, fields).await.map_err(Error::from) }
            })
            .await
    }

    /// Write a document (overwrite or merge-upsert), absorbing transient
    /// failures.
    pub async fn safe_set(&self, doc: &DocRef, value: Value, options: SetOptions) -> Result<()> {
        let name = format!("set:{doc}");
        self.retry
            .run(&name, WRITE_MAX_ATTEMPTS, || {
                let value = value.clone();
                async move {
                    self.store
                        .set(doc, value, options)
                        .await
                        .map_err(Error::from)
                }
            })
            .await
    }

    /// Run an atomic read-modify-write cycle.
    ///
    /// The body reads through the [`Transaction`] handle and buffers its
    /// writes; the commit validates the versions observed by the reads. On
    /// an aborted commit the whole body re-runs against freshly read
    /// state, so the body must not capture reads from a previous attempt.
    pub async fn safe_transaction<T, F, Fut>(&self, name: &str, body: F) -> Result<T>
    where
        F: Fn(Transaction) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let body = &body;
        self.retry
            .run(name, TRANSACTION_MAX_ATTEMPTS, || {
                let store = Arc::clone(&self.store);
                async move {
                    let txn = Transaction::begin(store);
                    let value = body(txn.clone()).await?;
                    txn.commit().await?;
                    Ok(value)
                }
            })
            .await
    }
}

impl fmt::Debug for ConflictSafeWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConflictSafeWriter")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
