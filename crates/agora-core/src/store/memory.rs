//! In-process versioned document store.
//!
//! The reference backend: a single `RwLock`-guarded map of versioned JSON
//! documents. Conditional commits take the write lock once, validate every
//! precondition against the live versions, and only then apply the batch,
//! which gives the same abort-on-conflict behavior a remote store provides
//! and makes genuine write contention observable in-process.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use super::{
    merge_values, DocRef, DocumentStore, Precondition, SetOptions, StoreResult, VersionedDocument,
    WriteOp,
};
use crate::error::StoreError;

#[derive(Debug, Clone)]
struct StoredDoc {
    data: Value,
    version: u64,
}

/// In-memory [`DocumentStore`] backend.
#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: RwLock<HashMap<DocRef, StoredDoc>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty store behind an `Arc`, ready to share across tasks.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of documents currently stored.
    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    /// Whether the store holds no documents.
    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    fn apply(docs: &mut HashMap<DocRef, StoredDoc>, write: &WriteOp) -> StoreResult<()> {
        match write {
            WriteOp::Set {
                doc,
                value,
                options,
            } => {
                match docs.get_mut(doc) {
                    Some(existing) => {
                        if options.merge {
                            merge_values(&mut existing.data, value);
                        } else {
                            existing.data = value.clone();
                        }
                        existing.version += 1;
                    }
                    None => {
                        let mut data = Value::Object(serde_json::Map::new());
                        if options.merge {
                            merge_values(&mut data, value);
                        } else {
                            data = value.clone();
                        }
                        docs.insert(doc.clone(), StoredDoc { data, version: 1 });
                    }
                }
                Ok(())
            }
            WriteOp::Update { doc, fields } => match docs.get_mut(doc) {
                Some(existing) => {
                    merge_values(&mut existing.data, fields);
                    existing.version += 1;
                    Ok(())
                }
                None => Err(StoreError::NotFound(doc.path())),
            },
            WriteOp::Delete { doc } => {
                docs.remove(doc);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, doc: &DocRef) -> StoreResult<Option<VersionedDocument>> {
        let docs = self.docs.read().await;
        Ok(docs.get(doc).map(|stored| VersionedDocument {
            data: stored.data.clone(),
            version: stored.version,
        }))
    }

    async fn update(&self, doc: &DocRef, fields: Value) -> StoreResult<()> {
        let mut docs = self.docs.write().await;
        Self::apply(&mut docs, &WriteOp::Update {
            doc: doc.clone(),
            fields,
        })
    }

    async fn set(&self, doc: &DocRef, value: Value, options: SetOptions) -> StoreResult<()> {
        let mut docs = self.docs.write().await;
        Self::apply(&mut docs, &WriteOp::Set {
            doc: doc.clone(),
            value,
            options,
        })
    }

    async fn delete(&self, doc: &DocRef) -> StoreResult<()> {
        let mut docs = self.docs.write().await;
        Self::apply(&mut docs, &WriteOp::Delete { doc: doc.clone() })
    }

    async fn commit(&self, preconditions: &[Precondition], writes: &[WriteOp]) -> StoreResult<()> {
        let mut docs = self.docs.write().await;

        for precondition in preconditions {
            let current = docs.get(&precondition.doc).map(|d| d.version);
            if current != precondition.version {
                return Err(StoreError::Aborted(format!(
                    "document {} changed since read (read version {:?}, now {:?})",
                    precondition.doc, precondition.version, current
                )));
            }
        }

        // All-or-nothing: an update against an absent document must fail the
        // whole batch before anything is applied.
        for write in writes {
            if let WriteOp::Update { doc, .. } = write {
                if !docs.contains_key(doc) {
                    return Err(StoreError::NotFound(doc.path()));
                }
            }
        }

        for write in writes {
            Self::apply(&mut docs, write)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn doc(id: &str) -> DocRef {
        DocRef::new("things", id)
    }

    #[tokio::test]
    async fn set_then_get_round_trips_with_version() {
        let store = MemoryStore::new();
        store
            .set(&doc("t-1"), json!({"a": 1}), SetOptions::default())
            .await
            .unwrap();

        let found = store.get(&doc("t-1")).await.unwrap().unwrap();
        assert_eq!(found.data, json!({"a": 1}));
        assert_eq!(found.version, 1);
    }

    #[tokio::test]
    async fn every_write_bumps_the_version() {
        let store = MemoryStore::new();
        let d = doc("t-1");
        store.set(&d, json!({"a": 1}), SetOptions::default()).await.unwrap();
        store.update(&d, json!({"b": 2})).await.unwrap();
        store.set(&d, json!({"c": 3}), SetOptions::merge()).await.unwrap();

        let found = store.get(&d).await.unwrap().unwrap();
        assert_eq!(found.version, 3);
        assert_eq!(found.data, json!({"a": 1, "b": 2, "c": 3}));
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store.update(&doc("ghost"), json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn merge_set_creates_missing_document() {
        let store = MemoryStore::new();
        store
            .set(&doc("t-1"), json!({"a": 1}), SetOptions::merge())
            .await
            .unwrap();
        let found = store.get(&doc("t-1")).await.unwrap().unwrap();
        assert_eq!(found.data, json!({"a": 1}));
    }

    #[tokio::test]
    async fn commit_applies_when_preconditions_hold() {
        let store = MemoryStore::new();
        let d = doc("t-1");
        store.set(&d, json!({"n": 0}), SetOptions::default()).await.unwrap();

        let read = store.get(&d).await.unwrap().unwrap();
        store
            .commit(
                &[Precondition {
                    doc: d.clone(),
                    version: Some(read.version),
                }],
                &[WriteOp::Set {
                    doc: d.clone(),
                    value: json!({"n": 1}),
                    options: SetOptions::default(),
                }],
            )
            .await
            .unwrap();

        let found = store.get(&d).await.unwrap().unwrap();
        assert_eq!(found.data, json!({"n": 1}));
        assert_eq!(found.version, 2);
    }

    #[tokio::test]
    async fn commit_aborts_on_stale_version() {
        let store = MemoryStore::new();
        let d = doc("t-1");
        store.set(&d, json!({"n": 0}), SetOptions::default()).await.unwrap();

        let read = store.get(&d).await.unwrap().unwrap();
        // Out-of-band write invalidates the read.
        store.set(&d, json!({"n": 99}), SetOptions::default()).await.unwrap();

        let err = store
            .commit(
                &[Precondition {
                    doc: d.clone(),
                    version: Some(read.version),
                }],
                &[WriteOp::Set {
                    doc: d.clone(),
                    value: json!({"n": 1}),
                    options: SetOptions::default(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));

        // Nothing was applied.
        let found = store.get(&d).await.unwrap().unwrap();
        assert_eq!(found.data, json!({"n": 99}));
    }

    #[tokio::test]
    async fn commit_aborts_when_absent_document_appeared() {
        let store = MemoryStore::new();
        let d = doc("t-1");

        // Read saw nothing; someone else creates the document.
        store.set(&d, json!({"n": 0}), SetOptions::default()).await.unwrap();

        let err = store
            .commit(
                &[Precondition {
                    doc: d.clone(),
                    version: None,
                }],
                &[WriteOp::Set {
                    doc: d.clone(),
                    value: json!({"n": 1}),
                    options: SetOptions::default(),
                }],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Aborted(_)));
    }

    #[tokio::test]
    async fn commit_with_failing_update_applies_nothing() {
        let store = MemoryStore::new();
        let d = doc("t-1");

        let err = store
            .commit(
                &[],
                &[
                    WriteOp::Set {
                        doc: d.clone(),
                        value: json!({"n": 1}),
                        options: SetOptions::default(),
                    },
                    WriteOp::Update {
                        doc: doc("ghost"),
                        fields: json!({"n": 2}),
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.get(&d).await.unwrap().is_none());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryStore::new();
        let d = doc("t-1");
        store.set(&d, json!({"a": 1}), SetOptions::default()).await.unwrap();
        store.delete(&d).await.unwrap();
        store.delete(&d).await.unwrap();
        assert!(store.get(&d).await.unwrap().is_none());
    }
}
