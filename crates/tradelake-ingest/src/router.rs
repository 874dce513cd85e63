//! Write-mode routing
//!
//! Turns a deduplicated batch into one commit under the requested write
//! semantic. Preconditions (mode, batch shape, store capabilities) are all
//! checked before the first store call.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TableConfig;
use crate::error::{IngestError, Result};
use crate::record::{DeleteKey, KeyedRecord};
use crate::store::{CommitInstant, CommitMetadata, TableStore, WriteBatch, WriteOptions, WriteRecord};

/// Write semantic of one batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    Insert,
    Upsert,
    BulkInsert,
    Delete,
}

impl WriteMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WriteMode::Insert => "insert",
            WriteMode::Upsert => "upsert",
            WriteMode::BulkInsert => "bulk_insert",
            WriteMode::Delete => "delete",
        }
    }
}

impl std::str::FromStr for WriteMode {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "insert" => Ok(WriteMode::Insert),
            "upsert" => Ok(WriteMode::Upsert),
            "bulk_insert" => Ok(WriteMode::BulkInsert),
            "delete" => Ok(WriteMode::Delete),
            other => Err(IngestError::config(format!(
                "Unsupported write operation '{}': expected insert, upsert, bulk_insert or delete",
                other
            ))),
        }
    }
}

impl std::fmt::Display for WriteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Deduplicated batch ready for routing
#[derive(Debug, Clone)]
pub enum RoutedBatch {
    Records(Vec<KeyedRecord>),
    Deletes(Vec<DeleteKey>),
}

impl RoutedBatch {
    pub fn len(&self) -> usize {
        match self {
            RoutedBatch::Records(records) => records.len(),
            RoutedBatch::Deletes(keys) => keys.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct WriteRouter {
    config: Arc<TableConfig>,
    store: Arc<dyn TableStore>,
}

impl WriteRouter {
    pub fn new(config: Arc<TableConfig>, store: Arc<dyn TableStore>) -> Self {
        Self { config, store }
    }

    /// Reject a mode the store cannot serve or a batch of the wrong shape
    pub fn check_preconditions(&self, mode: WriteMode, batch: &RoutedBatch) -> Result<()> {
        let capabilities = self.store.capabilities();

        match (mode, batch) {
            (WriteMode::Delete, RoutedBatch::Records(_)) => Err(IngestError::config(
                "delete mode expects delete keys, got full records",
            )),
            (WriteMode::Delete, RoutedBatch::Deletes(_)) => Ok(()),
            (_, RoutedBatch::Deletes(_)) => Err(IngestError::config(format!(
                "{} mode expects records, got delete keys",
                mode
            ))),
            (WriteMode::Upsert, _) if !capabilities.point_lookup => Err(IngestError::config(
                "upsert requires a table store with point lookup support",
            )),
            (WriteMode::BulkInsert, _) if !capabilities.bulk_insert => Err(IngestError::config(
                "bulk_insert requires a table store with bulk insert support",
            )),
            _ => Ok(()),
        }
    }

    /// Apply `batch` as exactly one commit.
    ///
    /// Cancellation observed before the commit call rolls the inflight
    /// instant back; once the commit call is made the outcome is the store's.
    pub async fn apply(
        &self,
        mode: WriteMode,
        batch: RoutedBatch,
        cancel: &CancellationToken,
    ) -> Result<CommitMetadata> {
        self.check_preconditions(mode, &batch)?;
        if cancel.is_cancelled() {
            return Err(IngestError::Cancelled);
        }

        let table = &self.config.table;
        let instant = self.store.start_commit(table, mode).await?;
        debug!(instant = %instant, mode = %mode, records = batch.len(), "Started commit");

        let records = match self.build_records(mode, batch).await {
            Ok(records) => records,
            Err(e) => {
                self.rollback(instant).await;
                return Err(e);
            },
        };

        if cancel.is_cancelled() {
            self.rollback(instant).await;
            return Err(IngestError::Cancelled);
        }

        let write = WriteBatch {
            operation: mode,
            records,
            options: WriteOptions {
                skip_index: mode == WriteMode::BulkInsert,
                storage: self.config.storage.clone(),
            },
        };

        let metadata = self.store.commit(table, instant, write).await?;
        info!(
            instant = %metadata.instant,
            mode = %mode,
            inserts = metadata.inserts(),
            updates = metadata.updates(),
            deletes = metadata.deletes(),
            partitions = metadata.partitions.len(),
            "Commit completed"
        );
        Ok(metadata)
    }

    async fn build_records(&self, mode: WriteMode, batch: RoutedBatch) -> Result<Vec<WriteRecord>> {
        match (mode, batch) {
            (WriteMode::Delete, RoutedBatch::Deletes(keys)) => {
                Ok(keys.into_iter().map(WriteRecord::Delete).collect())
            },
            (WriteMode::Upsert, RoutedBatch::Records(records)) => self.tag_upserts(records).await,
            (_, RoutedBatch::Records(records)) => Ok(records
                .into_iter()
                .map(|r| WriteRecord::Insert {
                    key: r.key,
                    partition: r.partition,
                    record: r.record,
                })
                .collect()),
            (mode, RoutedBatch::Deletes(_)) => Err(IngestError::config(format!(
                "{} mode expects records, got delete keys",
                mode
            ))),
        }
    }

    /// Tag each record as insert or update by looking its key up
    async fn tag_upserts(&self, records: Vec<KeyedRecord>) -> Result<Vec<WriteRecord>> {
        let keys: Vec<_> = records
            .iter()
            .map(|r| (r.partition.clone(), r.key.clone()))
            .collect();
        let existing = self.store.existing_keys(&self.config.table, &keys).await?;

        debug!(
            records = records.len(),
            existing = existing.len(),
            "Tagged upsert records against the table"
        );

        Ok(records
            .into_iter()
            .map(|r| {
                if existing.contains(&(r.partition.clone(), r.key.clone())) {
                    WriteRecord::Update {
                        key: r.key,
                        partition: r.partition,
                        record: r.record,
                    }
                } else {
                    WriteRecord::Insert {
                        key: r.key,
                        partition: r.partition,
                        record: r.record,
                    }
                }
            })
            .collect())
    }

    async fn rollback(&self, instant: CommitInstant) {
        if let Err(e) = self.store.abort_commit(&self.config.table, instant).await {
            warn!(instant = %instant, error = %e, "Failed to roll back inflight instant");
        } else {
            info!(instant = %instant, "Rolled back inflight instant");
        }
    }
}
