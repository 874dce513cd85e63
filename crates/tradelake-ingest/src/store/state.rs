//! Table state shared by the bundled stores
//!
//! Every mutation validates the whole batch first and only then touches the
//! records, so a rejected commit leaves the table exactly as it was.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use super::{
    CommitInstant, CommitMetadata, PartitionStats, RetentionDirective, RetentionReport,
    StoreError, StoreResult, StoredRecord, WriteBatch, WriteRecord,
};
use crate::catalog::CatalogSyncRequest;
use crate::config::StorageConfig;
use crate::record::{NormalizedRecord, PartitionPath, RecordKey};
use crate::router::WriteMode;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct StoredRow {
    pub record: NormalizedRecord,
    pub instant: CommitInstant,
}

/// A record version replaced or deleted by a later commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SupersededVersion {
    /// Commit that superseded the version
    pub superseded_by: CommitInstant,
}

/// Catalog registration as last synchronized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CatalogEntry {
    pub request: CatalogSyncRequest,
    pub partitions: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct TableState {
    pub partitions: BTreeMap<PartitionPath, BTreeMap<RecordKey, StoredRow>>,
    pub timeline: Vec<CommitMetadata>,
    pub archived_commits: usize,
    pub superseded: Vec<SupersededVersion>,
    pub last_instant: Option<CommitInstant>,
    pub storage: Option<StorageConfig>,
    pub catalog: Option<CatalogEntry>,
    /// Inflight instant; process-local, never persisted
    #[serde(skip)]
    pub inflight: Option<(CommitInstant, WriteMode)>,
}

impl TableState {
    pub fn start_commit(&mut self, table: &str, operation: WriteMode) -> StoreResult<CommitInstant> {
        if let Some((inflight, _)) = self.inflight {
            return Err(StoreError::ConcurrentWriter {
                table: table.to_string(),
                inflight: inflight.to_string(),
            });
        }
        let instant = CommitInstant::next_after(self.last_instant);
        self.last_instant = Some(instant);
        self.inflight = Some((instant, operation));
        Ok(instant)
    }

    pub fn abort_commit(&mut self, instant: CommitInstant) -> StoreResult<()> {
        self.take_inflight(instant).map(|_| ())
    }

    fn take_inflight(&mut self, instant: CommitInstant) -> StoreResult<WriteMode> {
        match self.inflight {
            Some((inflight, operation)) if inflight == instant => {
                self.inflight = None;
                Ok(operation)
            },
            _ => Err(StoreError::UnknownInstant(instant.to_string())),
        }
    }

    /// Validate, then apply the batch; the inflight instant is released either way
    pub fn commit(&mut self, instant: CommitInstant, batch: WriteBatch) -> StoreResult<CommitMetadata> {
        let started_as = self.take_inflight(instant)?;
        if started_as != batch.operation {
            return Err(StoreError::Rejected(format!(
                "instant {} was started for {} but the batch is {}",
                instant, started_as, batch.operation
            )));
        }

        self.validate(&batch)?;

        let mut stats: BTreeMap<PartitionPath, PartitionStats> = BTreeMap::new();
        let total_records = batch.records.len();

        for write in batch.records {
            match write {
                WriteRecord::Insert { key, partition, record } => {
                    let rows = self.partitions.entry(partition.clone()).or_default();
                    if rows.insert(key, StoredRow { record, instant }).is_some() {
                        self.superseded.push(SupersededVersion { superseded_by: instant });
                    }
                    stats.entry(partition).or_default().inserts += 1;
                },
                WriteRecord::Update { key, partition, record } => {
                    let rows = self.partitions.entry(partition.clone()).or_default();
                    rows.insert(key, StoredRow { record, instant });
                    self.superseded.push(SupersededVersion { superseded_by: instant });
                    stats.entry(partition).or_default().updates += 1;
                },
                WriteRecord::Delete(delete) => {
                    let targets: Vec<PartitionPath> = match delete.partition {
                        Some(partition) => vec![partition],
                        None => self.partitions.keys().cloned().collect(),
                    };
                    for partition in targets {
                        let removed = self
                            .partitions
                            .get_mut(&partition)
                            .and_then(|rows| rows.remove(&delete.key));
                        if removed.is_some() {
                            self.superseded.push(SupersededVersion { superseded_by: instant });
                            stats.entry(partition).or_default().deletes += 1;
                        }
                    }
                },
            }
        }

        self.partitions.retain(|_, rows| !rows.is_empty());
        self.storage = Some(batch.options.storage);

        let metadata = CommitMetadata {
            instant,
            operation: batch.operation,
            partitions: stats,
            total_records,
        };
        self.timeline.push(metadata.clone());
        Ok(metadata)
    }

    fn validate(&self, batch: &WriteBatch) -> StoreResult<()> {
        let mut seen: BTreeSet<(&PartitionPath, &RecordKey)> = BTreeSet::new();

        for write in &batch.records {
            match write {
                WriteRecord::Insert { key, partition, .. } => {
                    if batch.options.skip_index {
                        continue;
                    }
                    if self.contains(partition, key) || !seen.insert((partition, key)) {
                        return Err(StoreError::DuplicateKey {
                            key: key.to_string(),
                            partition: partition.to_string(),
                        });
                    }
                },
                WriteRecord::Update { key, partition, .. } => {
                    if !self.contains(partition, key) {
                        return Err(StoreError::Rejected(format!(
                            "update of key {} which does not exist in partition {}",
                            key, partition
                        )));
                    }
                },
                WriteRecord::Delete(_) => {},
            }
        }
        Ok(())
    }

    pub fn contains(&self, partition: &PartitionPath, key: &RecordKey) -> bool {
        self.partitions
            .get(partition)
            .is_some_and(|rows| rows.contains_key(key))
    }

    pub fn lookup(&self, partition: &PartitionPath, key: &RecordKey) -> Option<NormalizedRecord> {
        self.partitions
            .get(partition)
            .and_then(|rows| rows.get(key))
            .map(|row| row.record.clone())
    }

    pub fn scan(&self) -> Vec<StoredRecord> {
        self.partitions
            .iter()
            .flat_map(|(partition, rows)| {
                rows.iter().map(move |(key, row)| StoredRecord {
                    partition: partition.clone(),
                    key: key.clone(),
                    record: row.record.clone(),
                    instant: row.instant,
                })
            })
            .collect()
    }

    /// Archive oldest commits and clean superseded versions
    pub fn apply_retention(&mut self, directive: RetentionDirective) -> RetentionReport {
        let mut report = RetentionReport::default();

        if let Some(keep) = directive.archive_to {
            let excess = self.timeline.len().saturating_sub(keep);
            if excess > 0 {
                self.timeline.drain(..excess);
                self.archived_commits += excess;
                report.archived_commits = excess;
            }
        }

        if directive.clean {
            // Versions superseded at or after the oldest retained commit stay
            let horizon = self
                .timeline
                .len()
                .checked_sub(directive.cleaner_commits_retained)
                .and_then(|i| self.timeline.get(i))
                .map(|commit| commit.instant);

            if let Some(horizon) = horizon {
                let before = self.superseded.len();
                self.superseded.retain(|v| v.superseded_by >= horizon);
                report.cleaned_versions = before - self.superseded.len();
            }
        }

        report.remaining_commits = self.timeline.len();
        report
    }

    pub fn sync_catalog(&mut self, request: &CatalogSyncRequest) {
        let partitions = self
            .partitions
            .keys()
            .map(|partition| request.partition_spec(partition))
            .collect();
        self.catalog = Some(CatalogEntry {
            request: request.clone(),
            partitions,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::record::{DeleteKey, FieldValue, RawRecord};
    use crate::store::WriteOptions;

    fn record(price: f64) -> NormalizedRecord {
        NormalizedRecord::from_fields(
            RawRecord::new().with("price", price).into_fields(),
        )
    }

    fn insert(key: &str, partition: &str, price: f64) -> WriteRecord {
        WriteRecord::Insert {
            key: RecordKey::new(key.into()),
            partition: PartitionPath::new(partition.into()),
            record: record(price),
        }
    }

    fn batch(operation: WriteMode, records: Vec<WriteRecord>) -> WriteBatch {
        WriteBatch {
            operation,
            records,
            options: WriteOptions::default(),
        }
    }

    fn commit(state: &mut TableState, operation: WriteMode, records: Vec<WriteRecord>) -> StoreResult<CommitMetadata> {
        let instant = state.start_commit("db.t", operation)?;
        state.commit(instant, batch(operation, records))
    }

    #[test]
    fn test_single_inflight_instant() {
        let mut state = TableState::default();
        let first = state.start_commit("db.t", WriteMode::Insert).unwrap();
        let err = state.start_commit("db.t", WriteMode::Insert).unwrap_err();
        assert!(matches!(err, StoreError::ConcurrentWriter { .. }));

        state.abort_commit(first).unwrap();
        let second = state.start_commit("db.t", WriteMode::Insert).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_rejected_batch_leaves_state_untouched() {
        let mut state = TableState::default();
        commit(&mut state, WriteMode::Insert, vec![insert("id:1", "pair=A", 1.0)]).unwrap();

        let err = commit(
            &mut state,
            WriteMode::Insert,
            vec![insert("id:2", "pair=A", 2.0), insert("id:1", "pair=A", 3.0)],
        )
        .unwrap_err();

        assert!(matches!(err, StoreError::DuplicateKey { .. }));
        assert_eq!(state.scan().len(), 1);
        assert_eq!(state.timeline.len(), 1);
        assert!(state.inflight.is_none());
    }

    #[test]
    fn test_skip_index_overwrites_without_check() {
        let mut state = TableState::default();
        commit(&mut state, WriteMode::Insert, vec![insert("id:1", "pair=A", 1.0)]).unwrap();

        let instant = state.start_commit("db.t", WriteMode::BulkInsert).unwrap();
        let mut bulk = batch(WriteMode::BulkInsert, vec![insert("id:1", "pair=A", 9.0)]);
        bulk.options.skip_index = true;
        state.commit(instant, bulk).unwrap();

        let stored = state
            .lookup(&PartitionPath::new("pair=A".into()), &RecordKey::new("id:1".into()))
            .unwrap();
        assert_eq!(stored.get("price"), Some(&FieldValue::Double(9.0)));
    }

    #[test]
    fn test_unscoped_delete_hits_every_partition() {
        let mut state = TableState::default();
        commit(
            &mut state,
            WriteMode::Insert,
            vec![
                insert("id:1", "pair=A", 1.0),
                insert("id:1", "pair=B", 1.0),
                insert("id:2", "pair=A", 1.0),
            ],
        )
        .unwrap();

        let meta = commit(
            &mut state,
            WriteMode::Delete,
            vec![WriteRecord::Delete(DeleteKey {
                key: RecordKey::new("id:1".into()),
                partition: None,
            })],
        )
        .unwrap();

        assert_eq!(meta.deletes(), 2);
        let keys: Vec<_> = state.scan().into_iter().map(|r| r.key.to_string()).collect();
        assert_eq!(keys, vec!["id:2"]);
    }

    #[test]
    fn test_retention_archives_and_cleans() {
        let mut state = TableState::default();
        commit(&mut state, WriteMode::Insert, vec![insert("id:1", "pair=A", 1.0)]).unwrap();
        for price in 2..=5 {
            commit(
                &mut state,
                WriteMode::Upsert,
                vec![WriteRecord::Update {
                    key: RecordKey::new("id:1".into()),
                    partition: PartitionPath::new("pair=A".into()),
                    record: record(price as f64),
                }],
            )
            .unwrap();
        }
        assert_eq!(state.superseded.len(), 4);

        let report = state.apply_retention(RetentionDirective {
            archive_to: Some(2),
            clean: true,
            cleaner_commits_retained: 1,
        });

        assert_eq!(report.archived_commits, 3);
        assert_eq!(report.remaining_commits, 2);
        assert_eq!(report.cleaned_versions, 3);
        assert_eq!(state.superseded.len(), 1);
    }
}
