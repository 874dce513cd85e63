//! Write mode tests
//!
//! One commit per batch under insert, upsert, bulk_insert and delete, with
//! preconditions rejected before the store is touched.

mod common;

use common::{config_builder, delete_key, table_id, trade, TestTable};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tradelake_ingest::error::IngestError;
use tradelake_ingest::record::{FieldValue, RawRecord};
use tradelake_ingest::retention::LifecycleState;
use tradelake_ingest::store::{InMemoryTableStore, StoreCapabilities, StoreError, TableStore};
use tradelake_ingest::{ErrorKind, WriteMode};

// ============================================================================
// Insert
// ============================================================================

#[tokio::test]
async fn test_insert_existing_key_fails_whole_batch() {
    let table = TestTable::new();
    table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;

    let err = table
        .run(vec![trade(2, 100, "BTCUSD"), trade(1, 100, "BTCUSD")], WriteMode::Insert)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Write);
    assert!(matches!(err, IngestError::Write(StoreError::DuplicateKey { .. })));
    assert_eq!(table.commits().await, 1);
    assert_eq!(table.ids().await, vec![("1".to_string(), "BTCUSD".to_string())]);
}

#[tokio::test]
async fn test_failed_commit_walks_back_to_idle() {
    let table = TestTable::new();
    table.store.reject_commits(Some("disk full")).await;

    let err = table
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Write);

    // The instant was released, so the next run can commit
    table.store.reject_commits(None).await;
    let report = table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;
    assert_eq!(
        report.lifecycle,
        vec![
            LifecycleState::Idle,
            LifecycleState::Writing,
            LifecycleState::Committed,
            LifecycleState::Cleaning,
            LifecycleState::Idle,
        ]
    );
}

// ============================================================================
// Upsert
// ============================================================================

#[tokio::test]
async fn test_upsert_counts_inserts_and_updates() {
    let table = TestTable::new();
    table
        .commit(vec![trade(1, 100, "BTCUSD"), trade(2, 100, "BTCUSD")], WriteMode::Insert)
        .await;

    let report = table
        .commit(
            vec![
                trade(1, 100, "BTCUSD").with("fee", "0.5").with("version", 2_i64),
                trade(3, 100, "BTCUSD"),
            ],
            WriteMode::Upsert,
        )
        .await;

    assert_eq!(report.commit.updates(), 1);
    assert_eq!(report.commit.inserts(), 1);
    assert_eq!(table.rows().await.len(), 3);

    let updated = table
        .store
        .scan(&table_id())
        .await
        .unwrap()
        .into_iter()
        .find(|row| row.record.get("id") == Some(&FieldValue::Integer(1)))
        .unwrap();
    assert_eq!(updated.record.get("fee"), Some(&FieldValue::Double(0.5)));
    assert_eq!(updated.instant, report.commit.instant);
}

#[tokio::test]
async fn test_upsert_is_idempotent_on_replay() {
    let table = TestTable::new();
    let batch = vec![trade(1, 100, "BTCUSD"), trade(2, 200, "ETHUSD")];

    table.commit(batch.clone(), WriteMode::Upsert).await;
    let first: Vec<_> = table.rows().await.into_iter().map(|r| (r.key, r.record)).collect();

    table.commit(batch, WriteMode::Upsert).await;
    let second: Vec<_> = table.rows().await.into_iter().map(|r| (r.key, r.record)).collect();

    assert_eq!(first, second);
    assert_eq!(table.commits().await, 2);
}

#[tokio::test]
async fn test_upsert_without_point_lookup_rejected_before_store_call() {
    let store = Arc::new(InMemoryTableStore::with_capabilities(StoreCapabilities {
        point_lookup: false,
        bulk_insert: true,
    }));
    let table = TestTable::with_store(config_builder().build().unwrap(), store);

    let err = table
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::Upsert)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(table.store.store_calls(), 0);
}

// ============================================================================
// Bulk insert
// ============================================================================

#[tokio::test]
async fn test_bulk_insert_writes_all_partitions() {
    let table = TestTable::new();
    let batch: Vec<RawRecord> = (0..50)
        .map(|i| trade(i, 100, if i % 2 == 0 { "BTCUSD" } else { "ETHUSD" }))
        .collect();

    let report = table.commit(batch, WriteMode::BulkInsert).await;

    assert_eq!(report.commit.inserts(), 50);
    assert_eq!(report.commit.partitions.len(), 2);
    assert_eq!(table.rows().await.len(), 50);
}

#[tokio::test]
async fn test_bulk_insert_without_capability_rejected() {
    let store = Arc::new(InMemoryTableStore::with_capabilities(StoreCapabilities {
        point_lookup: true,
        bulk_insert: false,
    }));
    let table = TestTable::with_store(config_builder().build().unwrap(), store);

    let err = table
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::BulkInsert)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(table.store.store_calls(), 0);
}

// ============================================================================
// Delete
// ============================================================================

#[tokio::test]
async fn test_delete_tombstones_only_named_key() {
    let table = TestTable::new();
    table
        .commit(
            vec![trade(1, 100, "BTCUSD"), trade(1, 200, "BTCUSD"), trade(2, 100, "ETHUSD")],
            WriteMode::Insert,
        )
        .await;

    let report = table.commit(vec![delete_key(1, 100)], WriteMode::Delete).await;

    assert_eq!(report.commit.deletes(), 1);
    let remaining: Vec<_> = table
        .rows()
        .await
        .into_iter()
        .map(|r| r.key.to_string())
        .collect();
    assert_eq!(remaining.len(), 2);
    assert!(remaining.iter().all(|k| k != "id:1,close_time:1970-01-01 00:01:40.00"));
}

#[tokio::test]
async fn test_delete_with_partition_only_touches_that_partition() {
    let table = TestTable::new();
    table
        .commit(vec![trade(1, 100, "BTCUSD"), trade(1, 100, "ETHUSD")], WriteMode::Insert)
        .await;

    table
        .commit(vec![delete_key(1, 100).with("pair", "ETHUSD")], WriteMode::Delete)
        .await;

    assert_eq!(table.ids().await, vec![("1".to_string(), "BTCUSD".to_string())]);
}

#[tokio::test]
async fn test_delete_of_missing_key_still_commits() {
    let table = TestTable::new();
    let report = table.commit(vec![delete_key(9, 100)], WriteMode::Delete).await;
    assert_eq!(report.commit.deletes(), 0);
    assert_eq!(table.commits().await, 1);
}

#[tokio::test]
async fn test_delete_ignores_non_key_fields() {
    let table = TestTable::new();
    table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;

    // A bad fee would fail an insert; deletes never cast it
    let report = table
        .commit(vec![delete_key(1, 100).with("fee", "bad")], WriteMode::Delete)
        .await;
    assert_eq!(report.commit.deletes(), 1);
    assert!(table.rows().await.is_empty());
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_unknown_operation_never_reaches_store() {
    let table = TestTable::new();
    let status = table
        .pipeline
        .run_operation(vec![trade(1, 100, "BTCUSD")], "merge", &CancellationToken::new())
        .await;

    let err = status.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(table.store.store_calls(), 0);
}

#[tokio::test]
async fn test_inflight_instant_blocks_second_writer() {
    let table = TestTable::new();
    let inflight = table
        .store
        .start_commit(&table_id(), WriteMode::Upsert)
        .await
        .unwrap();

    let err = table
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::Upsert)
        .await
        .into_result()
        .unwrap_err();
    assert!(matches!(err, IngestError::Write(StoreError::ConcurrentWriter { .. })));

    table.store.abort_commit(&table_id(), inflight).await.unwrap();
    table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Upsert).await;
    assert_eq!(table.commits().await, 1);
}

#[tokio::test]
async fn test_cancelled_run_commits_nothing() {
    let table = TestTable::new();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = table
        .pipeline
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert, &cancel)
        .await
        .into_result()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Cancelled);
    assert_eq!(table.commits().await, 0);
}

#[tokio::test]
async fn test_empty_batch_commits_once() {
    let table = TestTable::new();
    let report = table.commit(Vec::new(), WriteMode::Upsert).await;

    assert_eq!(report.records_read, 0);
    assert_eq!(report.commit.total_records, 0);
    assert_eq!(table.commits().await, 1);
}
