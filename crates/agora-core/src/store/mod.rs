//! The document store boundary.
//!
//! The coordination layer owns no storage of its own; everything shared
//! between actors lives in a document store reached through the
//! [`DocumentStore`] trait: named collections of keyed JSON documents with
//! point reads, field merges, full writes, deletes, and an atomic
//! conditional commit. Two backends are provided: [`memory::MemoryStore`]
//! (in-process, the reference backend) and [`sqlite::SqliteStore`] (sqlx).
//!
//! Every stored document carries a version that increases on each write.
//! [`Transaction`] builds optimistic read-modify-write cycles on top of
//! that: reads record the observed version, writes are buffered, and the
//! commit submits both so the backend can reject the batch with
//! [`StoreError::Aborted`] if any read document changed in the meantime.

pub mod memory;
pub mod sqlite;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::StoreError;

/// Result alias for store boundary operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Address of a document: a collection name plus a document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocRef {
    /// The collection the document lives in.
    pub collection: String,
    /// The document id within the collection.
    pub id: String,
}

impl DocRef {
    /// Create a document reference.
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }

    /// The `collection/id` path of this reference.
    #[must_use]
    pub fn path(&self) -> String {
        format!("{}/{}", self.collection, self.id)
    }
}

impl fmt::Display for DocRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document value together with the version it was read at.
#[derive(Debug, Clone)]
pub struct VersionedDocument {
    /// The document contents.
    pub data: Value,
    /// The store version of the document at read time. Starts at 1 and
    /// increases with every write.
    pub version: u64,
}

/// Options for [`DocumentStore::set`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetOptions {
    /// Merge the given fields into an existing document instead of
    /// replacing it. A merge against an absent document creates it.
    pub merge: bool,
}

impl SetOptions {
    /// Merge-upsert semantics.
    #[must_use]
    pub const fn merge() -> Self {
        Self { merge: true }
    }
}

/// A version expectation recorded by a transactional read.
///
/// `version: None` means the document was absent at read time and must
/// still be absent at commit.
#[derive(Debug, Clone)]
pub struct Precondition {
    /// The document the expectation applies to.
    pub doc: DocRef,
    /// The version observed at read time, or `None` for an absent document.
    pub version: Option<u64>,
}

/// A buffered write inside a conditional commit.
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// Full write or merge-upsert, per [`SetOptions`].
    Set {
        /// Target document.
        doc: DocRef,
        /// The value to write.
        value: Value,
        /// Overwrite or merge.
        options: SetOptions,
    },
    /// Partial field merge into an existing document. Fails the commit with
    /// [`StoreError::NotFound`] if the document is absent.
    Update {
        /// Target document.
        doc: DocRef,
        /// The fields to merge.
        fields: Value,
    },
    /// Delete the document. Deleting an absent document is a no-op.
    Delete {
        /// Target document.
        doc: DocRef,
    },
}

/// The consumed store contract: keyed JSON documents with atomic
/// conditional commits.
///
/// Plain `update`/`set`/`delete` calls are last-write-wins at the field
/// level and carry no cross-document ordering guarantee. Any value that
/// needs read-then-write consistency must go through [`commit`] with the
/// versions observed by the reads as preconditions; the backend applies
/// the batch all-or-nothing and rejects it with [`StoreError::Aborted`]
/// when a precondition no longer holds.
///
/// [`commit`]: DocumentStore::commit
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point-read a document, returning its value and version.
    async fn get(&self, doc: &DocRef) -> StoreResult<Option<VersionedDocument>>;

    /// Merge fields into an existing document.
    async fn update(&self, doc: &DocRef, fields: Value) -> StoreResult<()>;

    /// Write a document, replacing or merging per `options`.
    async fn set(&self, doc: &DocRef, value: Value, options: SetOptions) -> StoreResult<()>;

    /// Delete a document.
    async fn delete(&self, doc: &DocRef) -> StoreResult<()>;

    /// Atomically validate `preconditions` and apply `writes`,
    /// all-or-nothing.
    async fn commit(&self, preconditions: &[Precondition], writes: &[WriteOp]) -> StoreResult<()>;
}

/// Merge `patch` into `base`, JSON-merge-patch style.
///
/// Objects merge recursively; a `null` in the patch removes the key; any
/// other value replaces. Matches SQLite's `json_patch`, so both backends
/// agree on merge semantics.
pub fn merge_values(base: &mut Value, patch: &Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                if patch_value.is_null() {
                    base_map.remove(key);
                } else {
                    merge_values(
                        base_map.entry(key.clone()).or_insert(Value::Null),
                        patch_value,
                    );
                }
            }
        }
        (base, patch) => {
            *base = patch.clone();
        }
    }
}

#[derive(Debug, Default)]
struct TransactionState {
    reads: Vec<Precondition>,
    writes: Vec<WriteOp>,
}

/// Handle given to a `safe_transaction` body.
///
/// Reads go straight to the store and record the observed version in the
/// read set; writes are buffered until the body returns. The commit then
/// submits the read set as preconditions along with the buffered writes.
/// Reads observe committed state only, never the transaction's own
/// buffered writes, so perform all reads before the writes that depend on
/// them.
#[derive(Clone)]
pub struct Transaction {
    store: Arc<dyn DocumentStore>,
    state: Arc<Mutex<TransactionState>>,
}

impl Transaction {
    pub(crate) fn begin(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            state: Arc::new(Mutex::new(TransactionState::default())),
        }
    }

    /// Read a document and record its version in the read set.
    pub async fn get(&self, doc: &DocRef) -> StoreResult<Option<VersionedDocument>> {
        let found = self.store.get(doc).await?;
        let mut state = self.state.lock().await;
        state.reads.push(Precondition {
            doc: doc.clone(),
            version: found.as_ref().map(|d| d.version),
        });
        Ok(found)
    }

    /// Buffer a full or merge write.
    pub async fn set(&self, doc: &DocRef, value: Value, options: SetOptions) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.writes.push(WriteOp::Set {
            doc: doc.clone(),
            value,
            options,
        });
        Ok(())
    }

    /// Buffer a partial field merge.
    pub async fn update(&self, doc: &DocRef, fields: Value) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.writes.push(WriteOp::Update {
            doc: doc.clone(),
            fields,
        });
        Ok(())
    }

    /// Buffer a delete.
    pub async fn delete(&self, doc: &DocRef) -> StoreResult<()> {
        let mut state = self.state.lock().await;
        state.writes.push(WriteOp::Delete { doc: doc.clone() });
        Ok(())
    }

    /// Submit the buffered writes under the recorded preconditions.
    ///
    /// A read-only transaction (no buffered writes) commits trivially.
    pub(crate) async fn commit(self) -> StoreResult<()> {
        let state = {
            let mut guard = self.state.lock().await;
            std::mem::take(&mut *guard)
        };
        if state.writes.is_empty() {
            return Ok(());
        }
        self.store.commit(&state.reads, &state.writes).await
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction").finish_non_exhaustive()
    }
}
