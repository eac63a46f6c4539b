//! Staggered batches drive real store writes strictly in order, spaced by
//! the configured delay, and cut off at the first permanent failure.

mod common;

use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde_json::json;

use agora_core::store::memory::MemoryStore;
use agora_core::{run_staggered_batch, ConflictSafeWriter, DocRef, Error, SetOptions, StoreError};

#[tokio::test]
async fn batched_writes_land_in_order_with_spacing() {
    let writer = ConflictSafeWriter::new(MemoryStore::shared());
    let delay = Duration::from_millis(50);
    let stamps: Mutex<Vec<(&str, Instant)>> = Mutex::new(Vec::new());

    let write = |id: &'static str| {
        let writer = writer.clone();
        let stamps = &stamps;
        async move {
            writer
                .safe_set(
                    &DocRef::new("events", id),
                    json!({"id": id}),
                    SetOptions::default(),
                )
                .await?;
            stamps.lock().unwrap().push((id, Instant::now()));
            Ok(())
        }
    };

    run_staggered_batch(
        vec![write("e-1").boxed(), write("e-2").boxed(), write("e-3").boxed()],
        delay,
    )
    .await
    .unwrap();

    let stamps = stamps.into_inner().unwrap();
    let order: Vec<&str> = stamps.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec!["e-1", "e-2", "e-3"]);
    for pair in stamps.windows(2) {
        assert!(pair[1].1 - pair[0].1 >= delay);
    }

    for id in ["e-1", "e-2", "e-3"] {
        assert!(writer
            .store()
            .get(&DocRef::new("events", id))
            .await
            .unwrap()
            .is_some());
    }
}

#[tokio::test]
async fn permanent_failure_stops_the_batch_before_later_writes() {
    let writer = ConflictSafeWriter::new(MemoryStore::shared());

    let set = |id: &'static str| {
        let writer = writer.clone();
        async move {
            writer
                .safe_set(
                    &DocRef::new("events", id),
                    json!({"id": id}),
                    SetOptions::default(),
                )
                .await
        }
    };
    // Update against a document that does not exist: permanent NotFound.
    let doomed = {
        let writer = writer.clone();
        async move {
            writer
                .safe_update(&DocRef::new("events", "missing"), json!({"id": "x"}))
                .await
        }
    };

    let err = run_staggered_batch(
        vec![set("e-1").boxed(), doomed.boxed(), set("e-3").boxed()],
        Duration::from_millis(1),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, Error::Store(StoreError::NotFound(_))));

    // The first write landed; the one after the failure never ran.
    let store = writer.store();
    assert!(store.get(&DocRef::new("events", "e-1")).await.unwrap().is_some());
    assert!(store.get(&DocRef::new("events", "e-3")).await.unwrap().is_none());
}

#[tokio::test]
async fn exhausted_retries_abort_the_batch() {
    use agora_core::{RetryCoordinator, RetryPolicy};
    use common::FlakyStore;

    let flaky = FlakyStore::new(MemoryStore::shared());
    let writer = ConflictSafeWriter::with_retry(
        flaky.clone(),
        RetryCoordinator::with_policy(RetryPolicy::new().with_table_ms(vec![1]).with_jitter_ms(0)),
    );

    // More aborts than the transaction budget: the first operation
    // exhausts its retries and the second never runs.
    flaky.inject_aborts(16);

    let bump = || {
        let writer = writer.clone();
        async move {
            writer
                .safe_transaction("counter:bump", |txn| {
                    let doc = DocRef::new("counters", "c-1");
                    async move {
                        let current = txn
                            .get(&doc)
                            .await?
                            .and_then(|d| d.data.get("n").and_then(serde_json::Value::as_i64))
                            .unwrap_or(0);
                        txn.set(&doc, json!({"n": current + 1}), SetOptions::default())
                            .await?;
                        Ok(())
                    }
                })
                .await
        }
    };

    let err = run_staggered_batch(vec![bump().boxed(), bump().boxed()], Duration::from_millis(1))
        .await
        .unwrap_err();

    assert!(matches!(err, Error::RetryExhausted { attempts: 5, .. }));
    // No increment ever committed.
    assert!(writer
        .store()
        .get(&DocRef::new("counters", "c-1"))
        .await
        .unwrap()
        .is_none());
}
