//! Ingestion pipeline
//!
//! Runs one batch through normalize → key → dedup → route → retention and
//! reports a single terminal [`PipelineStatus`]. A batch either commits as a
//! whole or the run fails with the first error in batch order; nothing from
//! earlier stages is kept.
//!
//! Normalization and keying run on blocking worker tasks over contiguous
//! chunks of the batch. Deduplication runs per partition, at most
//! `parallelism` partitions at a time.

use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use tradelake_common::TableId;
use uuid::Uuid;

use crate::catalog::CatalogSyncRequest;
use crate::config::{CastFailurePolicy, TableConfig};
use crate::dedup::{dedup_deletes, split_by_partition, DedupStats, Deduplicator};
use crate::error::{ErrorKind, IngestError, Result};
use crate::keyer::RecordKeyer;
use crate::normalize::Normalizer;
use crate::record::{DeleteKey, KeyedRecord, PartitionPath, RawRecord, RecordKey};
use crate::retention::{
    CleanupGuards, Lifecycle, LifecycleState, RetentionOutcome, RetentionPolicy, RetentionRunner,
};
use crate::router::{RoutedBatch, WriteMode, WriteRouter};
use crate::store::{CommitMetadata, TableStore};

/// Summary of a successful run
#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub run_id: Uuid,
    pub table: TableId,
    pub mode: WriteMode,
    pub records_read: usize,
    /// Records skipped under [`CastFailurePolicy::DropRecord`]
    pub records_dropped: usize,
    pub duplicates_removed: usize,
    /// Duplicates decided by batch order because precombine values were equal
    pub ties_resolved: usize,
    pub commit: CommitMetadata,
    pub catalog_synced: bool,
    pub retention: RetentionOutcome,
    pub lifecycle: Vec<LifecycleState>,
}

/// Terminal result of one run
#[derive(Debug)]
pub enum PipelineStatus {
    Success(IngestReport),
    Failed(IngestError),
}

impl PipelineStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, PipelineStatus::Success(_))
    }

    pub fn report(&self) -> Option<&IngestReport> {
        match self {
            PipelineStatus::Success(report) => Some(report),
            PipelineStatus::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&IngestError> {
        match self {
            PipelineStatus::Success(_) => None,
            PipelineStatus::Failed(e) => Some(e),
        }
    }

    pub fn into_result(self) -> Result<IngestReport> {
        match self {
            PipelineStatus::Success(report) => Ok(report),
            PipelineStatus::Failed(e) => Err(e),
        }
    }
}

/// Output of the normalize/key stage for one record
enum Prepared {
    Keyed(KeyedRecord),
    Delete(DeleteKey),
}

struct PreparedBatch {
    items: Vec<Prepared>,
    dropped: usize,
}

pub struct IngestionPipeline {
    config: Arc<TableConfig>,
    store: Arc<dyn TableStore>,
    guards: CleanupGuards,
    background: Mutex<Vec<JoinHandle<RetentionOutcome>>>,
}

impl IngestionPipeline {
    /// Build a pipeline; the configuration is validated here, before any I/O
    pub fn new(config: Arc<TableConfig>, store: Arc<dyn TableStore>) -> Result<Self> {
        config.validate()?;
        Normalizer::from_config(&config)?;

        Ok(Self {
            config,
            store,
            guards: CleanupGuards::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Share cleanup guards with other pipelines writing the same tables
    pub fn with_cleanup_guards(mut self, guards: CleanupGuards) -> Self {
        self.guards = guards;
        self
    }

    pub fn config(&self) -> &TableConfig {
        &self.config
    }

    /// Run with the write operation given as text, as the job receives it
    pub async fn run_operation(
        &self,
        batch: Vec<RawRecord>,
        write_operation: &str,
        cancel: &CancellationToken,
    ) -> PipelineStatus {
        match write_operation.parse::<WriteMode>() {
            Ok(mode) => self.run(batch, mode, cancel).await,
            Err(e) => {
                error!(write_operation, error = %e, "Rejected write operation");
                PipelineStatus::Failed(e)
            },
        }
    }

    pub async fn run(
        &self,
        batch: Vec<RawRecord>,
        mode: WriteMode,
        cancel: &CancellationToken,
    ) -> PipelineStatus {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "ingest",
            run_id = %run_id,
            table = %self.config.table,
            mode = %mode
        );

        match self.execute(run_id, batch, mode, cancel).instrument(span.clone()).await {
            Ok(report) => {
                span.in_scope(|| {
                    info!(
                        records_read = report.records_read,
                        records_dropped = report.records_dropped,
                        duplicates_removed = report.duplicates_removed,
                        ties_resolved = report.ties_resolved,
                        instant = %report.commit.instant,
                        "Ingestion succeeded"
                    )
                });
                PipelineStatus::Success(report)
            },
            Err(e) => {
                span.in_scope(|| error!(error = %e, kind = ?e.kind(), "Ingestion failed"));
                PipelineStatus::Failed(e)
            },
        }
    }

    /// Wait for retention tasks spawned by asynchronous cleaning
    pub async fn wait_for_background(&self) -> Vec<RetentionOutcome> {
        let handles: Vec<_> = self.background.lock().await.drain(..).collect();
        let mut outcomes = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => {
                    warn!(error = %e, "Background retention task failed");
                    outcomes.push(RetentionOutcome::Failed { reason: e.to_string() });
                },
            }
        }
        outcomes
    }

    async fn execute(
        &self,
        run_id: Uuid,
        batch: Vec<RawRecord>,
        mode: WriteMode,
        cancel: &CancellationToken,
    ) -> Result<IngestReport> {
        let router = WriteRouter::new(Arc::clone(&self.config), Arc::clone(&self.store));
        let empty = match mode {
            WriteMode::Delete => RoutedBatch::Deletes(Vec::new()),
            _ => RoutedBatch::Records(Vec::new()),
        };
        router.check_preconditions(mode, &empty)?;

        let records_read = batch.len();
        info!(
            records = records_read,
            record_key_fields = ?self.config.record_key_fields,
            partition_fields = ?self.config.partition_fields,
            precombine_field = %self.config.precombine_field,
            table_type = ?self.config.storage.table_type,
            compression = %self.config.storage.compression_codec,
            "Starting ingestion"
        );

        ensure_not_cancelled(cancel)?;
        let prepared = self.prepare(batch, mode).await?;
        debug!(prepared = prepared.items.len(), dropped = prepared.dropped, "Normalized and keyed batch");

        ensure_not_cancelled(cancel)?;
        let (routed, stats) = self.deduplicate(prepared.items, mode).await?;
        debug!(
            surviving = routed.len(),
            duplicates_removed = stats.duplicates_removed,
            ties_resolved = stats.ties_resolved,
            "Deduplicated batch"
        );
        if stats.ties_resolved > 0 {
            warn!(
                ties = stats.ties_resolved,
                precombine_field = %self.config.precombine_field,
                "Equal precombine values resolved by batch order"
            );
        }

        let mut lifecycle = Lifecycle::new();
        advance(&mut lifecycle, LifecycleState::Writing);
        let commit = match router.apply(mode, routed, cancel).await {
            Ok(commit) => commit,
            Err(e) => {
                advance(&mut lifecycle, LifecycleState::Failed);
                advance(&mut lifecycle, LifecycleState::Idle);
                return Err(e);
            },
        };
        advance(&mut lifecycle, LifecycleState::Committed);

        let catalog_synced = self.sync_catalog().await;
        let retention = self.retain(&mut lifecycle).await;

        Ok(IngestReport {
            run_id,
            table: self.config.table.clone(),
            mode,
            records_read,
            records_dropped: prepared.dropped,
            duplicates_removed: stats.duplicates_removed,
            ties_resolved: stats.ties_resolved,
            commit,
            catalog_synced,
            retention,
            lifecycle: lifecycle.history().to_vec(),
        })
    }

    /// Normalize and key the batch on blocking workers, then apply the failure policy
    async fn prepare(&self, batch: Vec<RawRecord>, mode: WriteMode) -> Result<PreparedBatch> {
        let normalizer = Arc::new(match mode {
            WriteMode::Delete => Normalizer::for_deletes(&self.config)?,
            _ => Normalizer::from_config(&self.config)?,
        });
        let keyer = Arc::new(RecordKeyer::from_config(&self.config));
        let dedup = Arc::new(Deduplicator::from_config(&self.config));

        let chunk_size = batch.len().div_ceil(self.config.parallelism).max(1);
        let mut chunks: Vec<Vec<(usize, RawRecord)>> = Vec::new();
        let mut current = Vec::with_capacity(chunk_size);
        for item in batch.into_iter().enumerate() {
            current.push(item);
            if current.len() == chunk_size {
                chunks.push(std::mem::replace(&mut current, Vec::with_capacity(chunk_size)));
            }
        }
        if !current.is_empty() {
            chunks.push(current);
        }

        let handles = chunks.into_iter().map(|chunk| {
            let normalizer = Arc::clone(&normalizer);
            let keyer = Arc::clone(&keyer);
            let dedup = Arc::clone(&dedup);
            tokio::task::spawn_blocking(move || {
                chunk
                    .into_iter()
                    .map(|(index, raw)| {
                        prepare_record(&normalizer, &keyer, &dedup, mode, index, raw)
                            .map_err(|e| e.at_record(index))
                    })
                    .collect::<Vec<_>>()
            })
        });

        let mut items = Vec::new();
        let mut dropped = 0;
        for joined in futures::future::join_all(handles).await {
            let results = joined.map_err(|e| IngestError::Worker(e.to_string()))?;
            for result in results {
                let e = match result {
                    Ok(item) => {
                        items.push(item);
                        continue;
                    },
                    Err(e) => e,
                };
                // Only record-level cast and key failures are subject to the policy
                let droppable = matches!(e.kind(), ErrorKind::Cast | ErrorKind::Key);
                match self.config.failure_policy {
                    CastFailurePolicy::DropRecord if droppable => {
                        warn!(error = %e, "Dropping invalid record");
                        dropped += 1;
                    },
                    _ => return Err(e),
                }
            }
        }

        Ok(PreparedBatch { items, dropped })
    }

    async fn deduplicate(
        &self,
        items: Vec<Prepared>,
        mode: WriteMode,
    ) -> Result<(RoutedBatch, DedupStats)> {
        let mut records = Vec::with_capacity(items.len());
        let mut deletes = Vec::new();
        for item in items {
            match item {
                Prepared::Keyed(record) => records.push(record),
                Prepared::Delete(key) => deletes.push(key),
            }
        }

        if mode == WriteMode::Delete {
            let input_records = deletes.len();
            let (unique, removed) = dedup_deletes(deletes);
            let stats = DedupStats {
                input_records,
                output_records: unique.len(),
                duplicates_removed: removed,
                ties_resolved: 0,
            };
            return Ok((RoutedBatch::Deletes(unique), stats));
        }

        let mut first_seen: HashMap<(PartitionPath, RecordKey), usize> = HashMap::new();
        for record in &records {
            first_seen
                .entry((record.partition.clone(), record.key.clone()))
                .or_insert(record.position);
        }

        let dedup = Arc::new(Deduplicator::from_config(&self.config));
        let partitions = split_by_partition(records);

        let results: Vec<_> = stream::iter(partitions.into_values())
            .map(|group| {
                let dedup = Arc::clone(&dedup);
                tokio::task::spawn_blocking(move || dedup.dedup_partition(group))
            })
            .buffer_unordered(self.config.parallelism)
            .collect()
            .await;

        let mut winners = Vec::new();
        let mut stats = DedupStats::default();
        let mut first_error: Option<IngestError> = None;

        for joined in results {
            match joined.map_err(|e| IngestError::Worker(e.to_string()))? {
                Ok((partition_winners, partition_stats)) => {
                    winners.extend(partition_winners);
                    stats.merge(partition_stats);
                },
                Err(e) => {
                    let earlier = match (&first_error, e.record_index()) {
                        (None, _) => true,
                        (Some(current), Some(index)) => {
                            current.record_index().is_none_or(|c| index < c)
                        },
                        (Some(_), None) => false,
                    };
                    if earlier {
                        first_error = Some(e);
                    }
                },
            }
        }

        if let Some(e) = first_error {
            return Err(e);
        }

        winners.sort_by_key(|w| {
            first_seen
                .get(&(w.partition.clone(), w.key.clone()))
                .copied()
                .unwrap_or(w.position)
        });
        Ok((RoutedBatch::Records(winners), stats))
    }

    async fn sync_catalog(&self) -> bool {
        let Some(request) = CatalogSyncRequest::for_table(&self.config) else {
            debug!("Catalog sync disabled");
            return false;
        };

        match self.store.sync_catalog(&request).await {
            Ok(()) => {
                info!(
                    database = %request.table.database,
                    table = %request.table.table,
                    extractor = ?request.partition_extractor,
                    "Catalog synchronized"
                );
                true
            },
            Err(e) => {
                warn!(error = %e, "Catalog sync failed, commit stands");
                false
            },
        }
    }

    async fn retain(&self, lifecycle: &mut Lifecycle) -> RetentionOutcome {
        let runner = RetentionRunner::new(
            RetentionPolicy::new(self.config.retention.clone()),
            Arc::clone(&self.store),
            self.guards.clone(),
        );
        let table = &self.config.table;

        if self.config.retention.async_clean {
            return match runner.spawn(table) {
                Some(handle) => {
                    self.background.lock().await.push(handle);
                    advance(lifecycle, LifecycleState::Cleaning);
                    RetentionOutcome::Deferred
                },
                None => {
                    advance(lifecycle, LifecycleState::Idle);
                    RetentionOutcome::Skipped
                },
            };
        }

        advance(lifecycle, LifecycleState::Cleaning);
        let outcome = runner.run(table).await;
        advance(lifecycle, LifecycleState::Idle);
        outcome
    }
}

fn prepare_record(
    normalizer: &Normalizer,
    keyer: &RecordKeyer,
    dedup: &Deduplicator,
    mode: WriteMode,
    index: usize,
    raw: RawRecord,
) -> Result<Prepared> {
    let record = normalizer.normalize(raw)?;
    match mode {
        WriteMode::Delete => keyer.delete_key(&record).map(Prepared::Delete),
        _ => {
            let keyed = keyer.key(record, index)?;
            dedup.check_precombine(&keyed)?;
            Ok(Prepared::Keyed(keyed))
        },
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(IngestError::Cancelled)
    } else {
        Ok(())
    }
}

fn advance(lifecycle: &mut Lifecycle, next: LifecycleState) {
    if let Err(e) = lifecycle.transition(next) {
        warn!(error = %e, "Unexpected lifecycle transition");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::InMemoryTableStore;

    fn pipeline(store: Arc<InMemoryTableStore>) -> IngestionPipeline {
        let config = TableConfig::builder(TableId::new("crypto", "trades").unwrap())
            .record_key_fields(["id", "close_time"])
            .precombine_field("id")
            .parallelism(2)
            .build()
            .unwrap();
        IngestionPipeline::new(Arc::new(config), store).unwrap()
    }

    fn trade(id: i64, pair: &str) -> RawRecord {
        RawRecord::new()
            .with("id", id)
            .with("close_time", 100_i64)
            .with("open_time", 90_i64)
            .with("pair", pair)
            .with("fee", "0.1")
            .with("price", 10.0)
            .with("volume", 1.0)
    }

    #[tokio::test]
    async fn test_successful_run_walks_lifecycle() {
        let store = Arc::new(InMemoryTableStore::new());
        let status = pipeline(store.clone())
            .run(vec![trade(1, "BTCUSD"), trade(2, "ETHUSD")], WriteMode::Insert, &CancellationToken::new())
            .await;

        let report = status.into_result().unwrap();
        assert_eq!(report.commit.total_records, 2);
        assert!(report.catalog_synced);
        assert_eq!(
            report.lifecycle,
            vec![
                LifecycleState::Idle,
                LifecycleState::Writing,
                LifecycleState::Committed,
                LifecycleState::Cleaning,
                LifecycleState::Idle
            ]
        );
    }

    #[tokio::test]
    async fn test_first_error_in_batch_order() {
        let store = Arc::new(InMemoryTableStore::new());
        let batch = vec![
            trade(1, "BTCUSD"),
            trade(2, "BTCUSD").with("fee", "bad"),
            trade(3, "BTCUSD"),
            trade(4, "BTCUSD").with("price", "worse"),
        ];

        let status = pipeline(store.clone())
            .run(batch, WriteMode::Insert, &CancellationToken::new())
            .await;

        let err = status.error().unwrap();
        assert_eq!(err.record_index(), Some(1));
        assert_eq!(err.field(), Some("fee"));
        assert!(store.commit_history(&TableId::new("crypto", "trades").unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_no_commit() {
        let store = Arc::new(InMemoryTableStore::new());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let status = pipeline(store.clone()).run(vec![trade(1, "BTCUSD")], WriteMode::Upsert, &cancel).await;
        assert!(matches!(status, PipelineStatus::Failed(IngestError::Cancelled)));
        assert_eq!(store.store_calls(), 0);
    }
}
