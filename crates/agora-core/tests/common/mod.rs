//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use agora_core::{
    DocRef, DocumentStore, Precondition, SetOptions, StoreError, StoreResult, VersionedDocument,
    WriteOp,
};

/// A store wrapper that fails queued operations with injected errors
/// before delegating to the wrapped backend.
pub struct FlakyStore {
    inner: Arc<dyn DocumentStore>,
    commit_faults: Mutex<VecDeque<StoreError>>,
}

impl FlakyStore {
    pub fn new(inner: Arc<dyn DocumentStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            commit_faults: Mutex::new(VecDeque::new()),
        })
    }

    /// Queue an error to be returned by the next commit call.
    pub fn inject_commit_fault(&self, error: StoreError) {
        self.commit_faults.lock().unwrap().push_back(error);
    }

    /// Queue `count` transaction aborts.
    pub fn inject_aborts(&self, count: usize) {
        for _ in 0..count {
            self.inject_commit_fault(StoreError::Aborted("injected abort".into()));
        }
    }

    /// Number of injected faults not yet consumed.
    pub fn pending_faults(&self) -> usize {
        self.commit_faults.lock().unwrap().len()
    }

    fn next_commit_fault(&self) -> Option<StoreError> {
        self.commit_faults.lock().unwrap().pop_front()
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn get(&self, doc: &DocRef) -> StoreResult<Option<VersionedDocument>> {
        self.inner.get(doc).await
    }

    async fn update(&self, doc: &DocRef, fields: Value) -> StoreResult<()> {
        self.inner.update(doc, fields).await
    }

    async fn set(&self, doc: &DocRef, value: Value, options: SetOptions) -> StoreResult<()> {
        self.inner.set(doc, value, options).await
    }

    async fn delete(&self, doc: &DocRef) -> StoreResult<()> {
        self.inner.delete(doc).await
    }

    async fn commit(&self, preconditions: &[Precondition], writes: &[WriteOp]) -> StoreResult<()> {
        if let Some(fault) = self.next_commit_fault() {
            return Err(fault);
        }
        self.inner.commit(preconditions, writes).await
    }
}
