//! End-to-end tests for the ingestion pipeline
//!
//! These tests validate the full run for one batch:
//! - Failure on the first bad record, with no commit
//! - Drop policy for invalid records
//! - Precombine deduplication
//! - Additional column injection
//! - Catalog sync as a non-fatal step
//! - The local snapshot store fed from JSON files

mod common;

use common::{config_builder, delete_key, table_id, trade, TestTable};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tradelake_ingest::config::{AdditionalColumns, CastFailurePolicy, CatalogSyncConfig};
use tradelake_ingest::record::{FieldValue, RawRecord};
use tradelake_ingest::source::{BatchSource, JsonBatchSource};
use tradelake_ingest::store::{LocalTableStore, TableStore};
use tradelake_ingest::{ErrorKind, IngestionPipeline, PipelineStatus, WriteMode};

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_bad_fee_fails_batch_without_commit() {
    let table = TestTable::new();
    let batch = vec![
        RawRecord::new()
            .with("id", 1_i64)
            .with("close_time", 100_i64)
            .with("pair", "BTCUSD")
            .with("fee", "0.1")
            .with("version", 1_i64),
        RawRecord::new()
            .with("id", 1_i64)
            .with("close_time", 100_i64)
            .with("pair", "BTCUSD")
            .with("fee", "bad")
            .with("version", 2_i64),
    ];

    let status = table.run(batch, WriteMode::Upsert).await;

    let PipelineStatus::Failed(err) = status else {
        panic!("expected failure");
    };
    assert_eq!(err.kind(), ErrorKind::Cast);
    assert_eq!(err.field(), Some("fee"));
    assert_eq!(err.record_index(), Some(1));
    assert_eq!(table.commits().await, 0);
    assert!(table.rows().await.is_empty());
}

#[tokio::test]
async fn test_missing_key_field_is_key_error() {
    let table = TestTable::new();
    let batch = vec![
        trade(1, 100, "BTCUSD"),
        RawRecord::new()
            .with("close_time", 5_i64)
            .with("pair", "BTCUSD")
            .with("fee", 1.0),
    ];

    let err = table.run(batch, WriteMode::Insert).await.into_result().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Key);
    assert_eq!(err.field(), Some("id"));
    assert_eq!(table.commits().await, 0);
}

#[tokio::test]
async fn test_drop_policy_skips_invalid_records() {
    let config = config_builder()
        .failure_policy(CastFailurePolicy::DropRecord)
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    let report = table
        .commit(
            vec![
                trade(1, 100, "BTCUSD"),
                trade(2, 100, "BTCUSD").with("fee", "bad"),
                trade(3, 100, "BTCUSD").with("pair", ""),
                trade(4, 100, "ETHUSD"),
            ],
            WriteMode::Insert,
        )
        .await;

    assert_eq!(report.records_read, 4);
    assert_eq!(report.records_dropped, 2);
    assert_eq!(report.commit.total_records, 2);
}

#[tokio::test]
async fn test_drop_policy_skips_records_without_precombine_value() {
    let config = config_builder()
        .failure_policy(CastFailurePolicy::DropRecord)
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    let missing_version = RawRecord::new()
        .with("id", 2_i64)
        .with("close_time", 100_i64)
        .with("pair", "BTCUSD")
        .with("fee", "0.1");
    let report = table
        .commit(vec![trade(1, 100, "BTCUSD"), missing_version], WriteMode::Upsert)
        .await;

    assert_eq!(report.records_dropped, 1);
    assert_eq!(report.commit.total_records, 1);
    assert_eq!(table.ids().await, vec![("1".to_string(), "BTCUSD".to_string())]);
}

#[tokio::test]
async fn test_missing_precombine_value_aborts_by_default() {
    let table = TestTable::new();
    let missing_version = RawRecord::new()
        .with("id", 2_i64)
        .with("close_time", 100_i64)
        .with("pair", "BTCUSD")
        .with("fee", "0.1");

    let err = table
        .run(vec![trade(1, 100, "BTCUSD"), missing_version], WriteMode::Upsert)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Key);
    assert_eq!(err.field(), Some("version"));
    assert_eq!(err.record_index(), Some(1));
    assert_eq!(table.commits().await, 0);
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test]
async fn test_higher_version_survives() {
    let table = TestTable::new();
    let report = table
        .commit(
            vec![
                trade(1, 100, "BTCUSD").with("version", 1_i64),
                trade(1, 100, "BTCUSD").with("version", 2_i64),
            ],
            WriteMode::Upsert,
        )
        .await;

    assert_eq!(report.duplicates_removed, 1);
    let rows = table.rows().await;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.get("version"), Some(&FieldValue::Integer(2)));
}

#[tokio::test]
async fn test_equal_versions_reported_as_ties() {
    let table = TestTable::new();
    let report = table
        .commit(
            vec![
                trade(1, 100, "BTCUSD").with("note", "first"),
                trade(1, 100, "BTCUSD").with("note", "second"),
            ],
            WriteMode::Insert,
        )
        .await;

    assert_eq!(report.ties_resolved, 1);
    let rows = table.rows().await;
    assert_eq!(rows[0].record.get("note"), Some(&FieldValue::from("second")));
}

#[tokio::test]
async fn test_same_key_in_different_partitions_kept() {
    let table = TestTable::new();
    let report = table
        .commit(vec![trade(1, 100, "BTCUSD"), trade(1, 100, "ETHUSD")], WriteMode::Insert)
        .await;

    assert_eq!(report.duplicates_removed, 0);
    assert_eq!(report.commit.partitions.len(), 2);
}

// ============================================================================
// Normalization
// ============================================================================

#[tokio::test]
async fn test_additional_columns_injected() {
    let config = config_builder()
        .additional_columns(AdditionalColumns::parse(r#"{"exchange": "kraken"}"#).unwrap())
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;

    let rows = table.rows().await;
    assert_eq!(rows[0].record.get("exchange"), Some(&FieldValue::from("kraken")));
    assert_eq!(rows[0].record.get("fee"), Some(&FieldValue::Double(0.0026)));
}

#[tokio::test]
async fn test_injection_collision_fails_batch() {
    let config = config_builder()
        .additional_columns(AdditionalColumns::none().with("pair", "XBTUSD"))
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    let err = table
        .run(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(table.commits().await, 0);
}

#[tokio::test]
async fn test_injection_collision_fails_batch_under_drop_policy() {
    let config = config_builder()
        .additional_columns(AdditionalColumns::none().with("pair", "XBTUSD"))
        .failure_policy(CastFailurePolicy::DropRecord)
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    let err = table
        .run(vec![trade(1, 100, "BTCUSD"), trade(2, 100, "BTCUSD")], WriteMode::Insert)
        .await
        .into_result()
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Config);
    assert_eq!(table.commits().await, 0);
}

// ============================================================================
// Catalog sync
// ============================================================================

#[tokio::test]
async fn test_catalog_synced_with_partitions() {
    let table = TestTable::new();
    let report = table
        .commit(vec![trade(1, 100, "BTCUSD"), trade(2, 100, "ETHUSD")], WriteMode::Insert)
        .await;
    assert!(report.catalog_synced);

    let (request, partitions) = table.store.catalog_entry(&table_id()).await.unwrap();
    assert_eq!(request.table, table_id());
    assert_eq!(partitions, vec!["pair='BTCUSD'", "pair='ETHUSD'"]);
}

#[tokio::test]
async fn test_catalog_failure_does_not_fail_commit() {
    let table = TestTable::new();
    table.store.fail_catalog_sync(Some("metastore unavailable")).await;

    let report = table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;
    assert!(!report.catalog_synced);
    assert_eq!(table.commits().await, 1);
}

#[tokio::test]
async fn test_catalog_sync_can_be_disabled() {
    let config = config_builder()
        .catalog_sync(CatalogSyncConfig {
            enabled: false,
            ..CatalogSyncConfig::default()
        })
        .build()
        .unwrap();
    let table = TestTable::with_config(config);

    let report = table.commit(vec![trade(1, 100, "BTCUSD")], WriteMode::Insert).await;
    assert!(!report.catalog_synced);
    assert!(table.store.catalog_entry(&table_id()).await.is_none());
}

// ============================================================================
// Local store
// ============================================================================

#[tokio::test]
async fn test_json_batch_into_local_store() {
    let input = TempDir::new().unwrap();
    let output = TempDir::new().unwrap();

    std::fs::write(
        input.path().join("part-0000.json"),
        concat!(
            r#"{"id": 1, "close_time": 1616663618, "pair": "XBTUSD", "fee": "0.26", "version": 1}"#,
            "\n",
            r#"{"id": 2, "close_time": 1616663619, "pair": "ETHUSD", "fee": "0.10", "version": 1}"#,
            "\n"
        ),
    )
    .unwrap();
    std::fs::write(
        input.path().join("part-0001.json"),
        r#"[{"id": 1, "close_time": 1616663618, "pair": "XBTUSD", "fee": "0.30", "version": 2}]"#,
    )
    .unwrap();

    let batch = JsonBatchSource::new(input.path()).read_batch().await.unwrap();
    assert_eq!(batch.len(), 3);

    let config = config_builder().output_path(output.path()).build().unwrap();
    let store = Arc::new(LocalTableStore::new(output.path()));
    let pipeline = IngestionPipeline::new(Arc::new(config), store).unwrap();
    let report = pipeline
        .run(batch, WriteMode::Upsert, &CancellationToken::new())
        .await
        .into_result()
        .unwrap();
    assert_eq!(report.commit.total_records, 2);

    let reopened = LocalTableStore::new(output.path());
    let rows = reopened.scan(&table_id()).await.unwrap();
    assert_eq!(rows.len(), 2);

    let xbt = rows.iter().find(|r| r.partition.as_str() == "pair=XBTUSD").unwrap();
    assert_eq!(xbt.record.get("fee"), Some(&FieldValue::Double(0.30)));
    assert_eq!(xbt.key.as_str(), "id:1,close_time:2021-03-25 09:13:38.00");
}

#[tokio::test]
async fn test_delete_against_local_store() {
    let output = TempDir::new().unwrap();
    let config = Arc::new(config_builder().output_path(output.path()).build().unwrap());
    let store = Arc::new(LocalTableStore::new(output.path()));
    let pipeline = IngestionPipeline::new(config, store.clone()).unwrap();
    let cancel = CancellationToken::new();

    pipeline
        .run(vec![trade(1, 100, "BTCUSD"), trade(2, 100, "BTCUSD")], WriteMode::Insert, &cancel)
        .await
        .into_result()
        .unwrap();
    pipeline
        .run(vec![delete_key(1, 100)], WriteMode::Delete, &cancel)
        .await
        .into_result()
        .unwrap();

    let rows = store.scan(&table_id()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].record.get("id"), Some(&FieldValue::Integer(2)));
    assert_eq!(store.commit_history(&table_id()).await.unwrap().len(), 2);
}
