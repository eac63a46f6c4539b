//! Distributed lock manager over the document store.
//!
//! Mutual exclusion built purely from conditional transactions on lock
//! documents; there is no external lock service and no crash detection.
//! A lock names a resource and carries its holder plus an expiry
//! timestamp; expiry is the only recovery mechanism for holders that died
//! without releasing.
//!
//! Acquisition is single-shot and non-blocking: a busy lock reports
//! `false` and the caller decides whether to skip the cycle, try again
//! later, or fail the enclosing action.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::writer::ConflictSafeWriter;
use crate::error::{Error, Result, StoreError};
use crate::store::{DocRef, SetOptions};

/// Default lock lifetime: long enough for the longest guarded critical
/// section (a trade plus its balance and market writes) with margin,
/// short enough to bound staleness after a crash.
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(30);

/// Collection holding the lock documents.
const LOCKS_COLLECTION: &str = "locks";

/// A lock document as stored at `locks/{resource}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The agent currently holding the lock.
    pub holder_id: String,
    /// When the lock was acquired or taken over.
    pub acquired_at: DateTime<Utc>,
    /// When the lock stops being honored.
    pub expires_at: DateTime<Utc>,
}

impl LockRecord {
    /// Whether the lock is expired at the given instant.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Named mutual exclusion over the store.
#[derive(Debug, Clone)]
pub struct DistributedLockManager {
    writer: ConflictSafeWriter,
    ttl: chrono::Duration,
}

impl DistributedLockManager {
    /// Create a lock manager with the default TTL.
    #[must_use]
    pub fn new(writer: ConflictSafeWriter) -> Self {
        Self::with_ttl(writer, DEFAULT_LOCK_TTL)
    }

    /// Create a lock manager with a custom TTL.
    #[must_use]
    pub fn with_ttl(writer: ConflictSafeWriter, ttl: Duration) -> Self {
        Self {
            writer,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
        }
    }

    fn lock_ref(resource: &str) -> DocRef {
        DocRef::new(LOCKS_COLLECTION, resource)
    }

    fn lease_until(now: DateTime<Utc>, ttl: chrono::Duration) -> DateTime<Utc> {
        now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Try to acquire the lock on `resource` for `holder`.
    ///
    /// Returns `true` when the lock was free or expired and is now held by
    /// `holder`; `false` when another holder has it. Two concurrent
    /// acquirers cannot both succeed: the transaction of the loser aborts,
    /// retries, observes the winner's lock, and reports busy.
    pub async fn acquire(&self, resource: &str, holder: &str) -> Result<bool> {
        let doc = Self::lock_ref(resource);
        let name = format!("lock:acquire:{resource}");
        let ttl = self.ttl;

        let acquired = self
            .writer
            .safe_transaction(&name, |txn| {
                let doc = doc.clone();
                let holder = holder.to_string();
                async move {
                    let now = Utc::now();
                    if let Some(found) = txn.get(&doc).await? {
                        let current: LockRecord =
                            serde_json::from_value(found.data).map_err(StoreError::from)?;
                        if !current.is_expired_at(now) {
                            return Ok(false);
                        }
                        tracing::debug!(
                            resource = %doc.id,
                            previous_holder = %current.holder_id,
                            "taking over expired lock"
                        );
                    }
                    let record = LockRecord {
                        holder_id: holder,
                        acquired_at: now,
                        expires_at: Self::lease_until(now, ttl),
                    };
                    txn.set(&doc, serde_json::to_value(&record)?, SetOptions::default())
                        .await?;
                    Ok(true)
                }
            })
            .await?;

        if !acquired {
            tracing::debug!(resource, holder, "lock busy");
        }
        Ok(acquired)
    }

    /// Release the lock on `resource` if `holder` still owns it.
    ///
    /// Returns `true` when the lock was deleted. A release by a non-holder
    /// (for example after an expiry-driven takeover) is a logged no-op, so
    /// a stale caller can never release someone else's lock.
    pub async fn try_release(&self, resource: &str, holder: &str) -> Result<bool> {
        let doc = Self::lock_ref(resource);
        let name = format!("lock:release:{resource}");

        self.writer
            .safe_transaction(&name, |txn| {
                let doc = doc.clone();
                let holder = holder.to_string();
                async move {
                    match txn.get(&doc).await? {
                        None => {
                            tracing::debug!(resource = %doc.id, holder = %holder, "release of unheld lock");
                            Ok(false)
                        }
                        Some(found) => {
                            let current: LockRecord =
                                serde_json::from_value(found.data).map_err(StoreError::from)?;
                            if current.holder_id == holder {
                                txn.delete(&doc).await?;
                                Ok(true)
                            } else {
                                tracing::warn!(
                                    resource = %doc.id,
                                    holder = %holder,
                                    current_holder = %current.holder_id,
                                    "release by non-holder ignored"
                                );
                                Ok(false)
                            }
                        }
                    }
                }
            })
            .await
    }

    /// Release the lock, absorbing failures.
    ///
    /// A failed release is logged and left to self-heal at expiry; it is
    /// never worth failing the enclosing action over.
    pub async fn release(&self, resource: &str, holder: &str) {
        if let Err(err) = self.try_release(resource, holder).await {
            tracing::warn!(
                resource,
                holder,
                error = %err,
                "failed to release lock; expiry will self-heal"
            );
        }
    }

    /// Extend the current holder's lease by one TTL from now.
    ///
    /// Fails with [`Error::NotLockHolder`] when the lock is absent,
    /// expired, or held by someone else; the lock is left unchanged in all
    /// of those cases.
    pub async fn extend(&self, resource: &str, holder: &str) -> Result<DateTime<Utc>> {
        let doc = Self::lock_ref(resource);
        let name = format!("lock:extend:{resource}");
        let ttl = self.ttl;

        self.writer
            .safe_transaction(&name, |txn| {
                let doc = doc.clone();
                let holder = holder.to_string();
                async move {
                    let now = Utc::now();
                    let current: Option<LockRecord> = match txn.get(&doc).await? {
                        Some(found) => {
                            Some(serde_json::from_value(found.data).map_err(StoreError::from)?)
                        }
                        None => None,
                    };
                    match current {
                        Some(mut record)
                            if record.holder_id == holder && !record.is_expired_at(now) =>
                        {
                            record.expires_at = Self::lease_until(now, ttl);
                            let expires_at = record.expires_at;
                            txn.set(&doc, serde_json::to_value(&record)?, SetOptions::default())
                                .await?;
                            Ok(expires_at)
                        }
                        _ => Err(Error::NotLockHolder {
                            resource: doc.id.clone(),
                            holder,
                        }),
                    }
                }
            })
            .await
    }

    /// The current non-expired holder of `resource`, if any.
    pub async fn current_holder(&self, resource: &str) -> Result<Option<LockRecord>> {
        let doc = Self::lock_ref(resource);
        let found = self.writer.store().get(&doc).await.map_err(Error::from)?;
        match found {
            Some(found) => {
                let record: LockRecord =
                    serde_json::from_value(found.data).map_err(StoreError::from)?;
                if record.is_expired_at(Utc::now()) {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
            None => Ok(None),
        }
    }

    /// Run `section` under the lock on `resource`.
    ///
    /// Returns `Ok(None)` without running the section when the lock is
    /// busy. The lock is released on every exit path; a section error is
    /// returned after the release. If the lock expired while the section
    /// ran, the overlap is logged — the section's own writes are each
    /// transactional, so the exposure is bounded, but it should be visible
    /// in logs rather than silent.
    pub async fn with_lock<T, F, Fut>(
        &self,
        resource: &str,
        holder: &str,
        section: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.acquire(resource, holder).await? {
            return Ok(None);
        }

        let outcome = section().await;

        match self.current_holder(resource).await {
            Ok(Some(record)) if record.holder_id == holder => {}
            Ok(_) => {
                tracing::warn!(resource, holder, "lock expired during critical section");
            }
            Err(err) => {
                tracing::debug!(resource, holder, error = %err, "could not verify lock holdership");
            }
        }

        self.release(resource, holder).await;
        outcome.map(Some)
    }
}
