//! Shared fixtures for tradelake-ingest integration tests
//!
//! Builds small trade tables keyed by `(id, close_time)` and partitioned by
//! `pair`, backed by the in-memory store.

#![allow(dead_code)]

use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tradelake_common::TableId;
use tradelake_ingest::config::{FieldType, RetentionConfig, SchemaContract, TableConfig, TableConfigBuilder};
use tradelake_ingest::record::{FieldValue, PartitionPath, RawRecord};
use tradelake_ingest::store::{InMemoryTableStore, StoredRecord, TableStore};
use tradelake_ingest::{IngestReport, IngestionPipeline, PipelineStatus, WriteMode};

pub fn table_id() -> TableId {
    TableId::new("crypto", "trades").expect("valid table id")
}

/// Config builder for the test table; callers override what they need
pub fn config_builder() -> TableConfigBuilder {
    TableConfig::builder(table_id())
        .output_path("/lake")
        .record_key_fields(["id", "close_time"])
        .partition_fields(["pair"])
        .precombine_field("version")
        .schema(
            SchemaContract::new()
                .field("close_time", FieldType::Timestamp)
                .field("fee", FieldType::Double),
        )
        .retention(RetentionConfig {
            min_commits: 2,
            max_commits: 30,
            cleaner_commits_retained: 1,
            clean_trigger_commits: 10,
            async_clean: false,
        })
}

pub struct TestTable {
    pub store: Arc<InMemoryTableStore>,
    pub pipeline: IngestionPipeline,
}

impl TestTable {
    pub fn new() -> Self {
        Self::with_config(config_builder().build().expect("valid config"))
    }

    pub fn with_config(config: TableConfig) -> Self {
        Self::with_store(config, Arc::new(InMemoryTableStore::new()))
    }

    pub fn with_store(config: TableConfig, store: Arc<InMemoryTableStore>) -> Self {
        let pipeline =
            IngestionPipeline::new(Arc::new(config), store.clone()).expect("pipeline builds");
        Self { store, pipeline }
    }

    pub async fn run(&self, batch: Vec<RawRecord>, mode: WriteMode) -> PipelineStatus {
        self.pipeline.run(batch, mode, &CancellationToken::new()).await
    }

    pub async fn commit(&self, batch: Vec<RawRecord>, mode: WriteMode) -> IngestReport {
        match self.run(batch, mode).await {
            PipelineStatus::Success(report) => report,
            PipelineStatus::Failed(e) => panic!("expected a commit, got {}", e),
        }
    }

    pub async fn rows(&self) -> Vec<StoredRecord> {
        self.store.scan(&table_id()).await.expect("scan")
    }

    pub async fn commits(&self) -> usize {
        self.store.commit_history(&table_id()).await.expect("history").len()
    }

    /// Stored `(id, pair)` pairs, in scan order
    pub async fn ids(&self) -> Vec<(String, String)> {
        self.rows()
            .await
            .into_iter()
            .map(|row| {
                let id = row.record.get("id").and_then(FieldValue::render).unwrap_or_default();
                (id, partition_value(&row.partition))
            })
            .collect()
    }
}

impl Default for TestTable {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_value(path: &PartitionPath) -> String {
    path.as_str()
        .split_once('=')
        .map(|(_, value)| value.to_string())
        .unwrap_or_else(|| path.to_string())
}

/// A trade with key `(id, close_time)` in partition `pair`
pub fn trade(id: i64, close_time: i64, pair: &str) -> RawRecord {
    RawRecord::new()
        .with("id", id)
        .with("close_time", close_time)
        .with("pair", pair)
        .with("fee", "0.0026")
        .with("version", 1_i64)
}

pub fn delete_key(id: i64, close_time: i64) -> RawRecord {
    RawRecord::new().with("id", id).with("close_time", close_time)
}
