//! Table store abstraction
//!
//! The ingestion layer drives a transactional table store through the
//! [`TableStore`] trait. A commit follows a requested → inflight → completed
//! timeline: [`TableStore::start_commit`] reserves an instant (one inflight
//! instant per table), [`TableStore::commit`] applies the batch atomically,
//! and [`TableStore::abort_commit`] rolls an inflight instant back.
//!
//! Two implementations ship with the crate:
//!
//! - [`InMemoryTableStore`]: process-local, used by tests and dry runs
//! - [`LocalTableStore`]: JSON snapshot per table under the output path

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tradelake_common::TableId;

use crate::catalog::CatalogSyncRequest;
use crate::config::StorageConfig;
use crate::record::{DeleteKey, NormalizedRecord, PartitionPath, RecordKey};
use crate::router::WriteMode;

pub mod local;
pub mod memory;
mod state;

pub use local::LocalTableStore;
pub use memory::InMemoryTableStore;

/// Errors reported by a table store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Concurrent writer on {table}: instant {inflight} is still inflight")]
    ConcurrentWriter { table: String, inflight: String },

    #[error("Key {key} already exists in partition {partition}")]
    DuplicateKey { key: String, partition: String },

    #[error("Instant {0} is not inflight")]
    UnknownInstant(String),

    #[error("Commit rejected: {0}")]
    Rejected(String),

    #[error("Store IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store state is corrupt: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Commit instants
// ============================================================================

const INSTANT_SECONDS_FORMAT: &str = "%Y%m%d%H%M%S";

/// Timeline id of one commit, rendered `yyyyMMddHHmmssSSS` in UTC
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CommitInstant {
    millis: i64,
}

impl CommitInstant {
    pub fn from_millis(millis: i64) -> Self {
        Self { millis }
    }

    /// Next instant on a timeline whose latest instant is `previous`.
    ///
    /// Wall-clock milliseconds, bumped past `previous` when the clock has not
    /// moved on, so instants are strictly increasing per table.
    pub fn next_after(previous: Option<CommitInstant>) -> Self {
        let now = Self::from_millis(Utc::now().timestamp_millis());
        match previous {
            Some(prev) if prev >= now => Self::from_millis(prev.millis + 1),
            _ => now,
        }
    }

    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    pub fn parse(text: &str) -> StoreResult<Self> {
        let invalid = || StoreError::Corrupt(format!("'{}' is not a commit instant", text));

        if text.len() != 17 || !text.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let (seconds, millis) = text.split_at(14);
        let seconds = NaiveDateTime::parse_from_str(seconds, INSTANT_SECONDS_FORMAT)
            .map_err(|_| invalid())?;
        let millis: i64 = millis.parse().map_err(|_| invalid())?;

        Ok(Self::from_millis(seconds.and_utc().timestamp_millis() + millis))
    }
}

impl std::fmt::Display for CommitInstant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match DateTime::from_timestamp_millis(self.millis) {
            Some(dt) => write!(
                f,
                "{}{:03}",
                dt.format(INSTANT_SECONDS_FORMAT),
                self.millis.rem_euclid(1000)
            ),
            None => write!(f, "{}", self.millis),
        }
    }
}

impl TryFrom<String> for CommitInstant {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        Self::parse(&value)
    }
}

impl From<CommitInstant> for String {
    fn from(value: CommitInstant) -> Self {
        value.to_string()
    }
}

// ============================================================================
// Write batches
// ============================================================================

/// One change applied by a commit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WriteRecord {
    /// New key; the store rejects it if the key exists (unless indexing is skipped)
    Insert {
        key: RecordKey,
        partition: PartitionPath,
        record: NormalizedRecord,
    },
    /// Replace a stored record in place
    Update {
        key: RecordKey,
        partition: PartitionPath,
        record: NormalizedRecord,
    },
    /// Tombstone a key, in one partition or all of them
    Delete(DeleteKey),
}

impl WriteRecord {
    pub fn key(&self) -> &RecordKey {
        match self {
            WriteRecord::Insert { key, .. } | WriteRecord::Update { key, .. } => key,
            WriteRecord::Delete(delete) => &delete.key,
        }
    }
}

/// Per-commit options passed through to the store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteOptions {
    /// Skip per-record uniqueness checks and index maintenance (bulk insert)
    pub skip_index: bool,
    pub storage: StorageConfig,
}

/// Everything one commit applies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteBatch {
    pub operation: WriteMode,
    pub records: Vec<WriteRecord>,
    pub options: WriteOptions,
}

/// Change counts of one partition within a commit
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionStats {
    pub inserts: usize,
    pub updates: usize,
    pub deletes: usize,
}

/// Completed commit as recorded on the table timeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub instant: CommitInstant,
    pub operation: WriteMode,
    pub partitions: BTreeMap<PartitionPath, PartitionStats>,
    pub total_records: usize,
}

impl CommitMetadata {
    pub fn inserts(&self) -> usize {
        self.partitions.values().map(|p| p.inserts).sum()
    }

    pub fn updates(&self) -> usize {
        self.partitions.values().map(|p| p.updates).sum()
    }

    pub fn deletes(&self) -> usize {
        self.partitions.values().map(|p| p.deletes).sum()
    }
}

/// A stored record as returned by reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub partition: PartitionPath,
    pub key: RecordKey,
    pub record: NormalizedRecord,
    /// Commit that last wrote this record
    pub instant: CommitInstant,
}

// ============================================================================
// Retention
// ============================================================================

/// Declarative retention instruction issued after a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionDirective {
    /// Archive the oldest commits until this many remain; `None` keeps all
    pub archive_to: Option<usize>,
    /// Run the cleaner over superseded record versions
    pub clean: bool,
    /// Superseded versions written by the newest this-many commits are kept
    pub cleaner_commits_retained: usize,
}

impl RetentionDirective {
    pub fn is_noop(&self) -> bool {
        self.archive_to.is_none() && !self.clean
    }
}

/// What the store did for a [`RetentionDirective`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub archived_commits: usize,
    pub cleaned_versions: usize,
    pub remaining_commits: usize,
}

// ============================================================================
// Store trait
// ============================================================================

/// Optional store features the router depends on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCapabilities {
    /// Point lookup by record key, required by upsert
    pub point_lookup: bool,
    /// Unindexed appends, required by bulk insert
    pub bulk_insert: bool,
}

impl StoreCapabilities {
    pub fn full() -> Self {
        Self {
            point_lookup: true,
            bulk_insert: true,
        }
    }
}

impl Default for StoreCapabilities {
    fn default() -> Self {
        Self::full()
    }
}

#[async_trait]
pub trait TableStore: Send + Sync {
    fn capabilities(&self) -> StoreCapabilities;

    /// Reserve the next instant; fails if another instant is inflight
    async fn start_commit(&self, table: &TableId, operation: WriteMode) -> StoreResult<CommitInstant>;

    /// Apply `batch` under an inflight instant, all or nothing
    async fn commit(
        &self,
        table: &TableId,
        instant: CommitInstant,
        batch: WriteBatch,
    ) -> StoreResult<CommitMetadata>;

    /// Roll back an inflight instant without applying anything
    async fn abort_commit(&self, table: &TableId, instant: CommitInstant) -> StoreResult<()>;

    /// Point lookup of one record
    async fn lookup(
        &self,
        table: &TableId,
        partition: &PartitionPath,
        key: &RecordKey,
    ) -> StoreResult<Option<NormalizedRecord>>;

    /// Subset of `keys` that currently exist in the table
    async fn existing_keys(
        &self,
        table: &TableId,
        keys: &[(PartitionPath, RecordKey)],
    ) -> StoreResult<BTreeSet<(PartitionPath, RecordKey)>> {
        let mut found = BTreeSet::new();
        for (partition, key) in keys {
            if self.lookup(table, partition, key).await?.is_some() {
                found.insert((partition.clone(), key.clone()));
            }
        }
        Ok(found)
    }

    /// Every live record, ordered by partition then key
    async fn scan(&self, table: &TableId) -> StoreResult<Vec<StoredRecord>>;

    /// Completed commits on the active timeline, oldest first
    async fn commit_history(&self, table: &TableId) -> StoreResult<Vec<CommitMetadata>>;

    async fn apply_retention(
        &self,
        table: &TableId,
        directive: RetentionDirective,
    ) -> StoreResult<RetentionReport>;

    async fn sync_catalog(&self, request: &CatalogSyncRequest) -> StoreResult<()>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_instant_format() {
        let instant = CommitInstant::parse("20210325091338120").unwrap();
        assert_eq!(instant.to_string(), "20210325091338120");
        assert_eq!(instant.as_millis(), 1_616_663_618_120);
        assert!(CommitInstant::parse("2021-03-25").is_err());
        assert!(CommitInstant::parse("20211325091338120").is_err());
    }

    #[test]
    fn test_instants_strictly_increase() {
        let far_future = CommitInstant::from_millis(Utc::now().timestamp_millis() + 60_000);
        let next = CommitInstant::next_after(Some(far_future));
        assert!(next > far_future);
        assert_eq!(next.as_millis(), far_future.as_millis() + 1);
        assert!(CommitInstant::next_after(None) > CommitInstant::from_millis(0));
    }

    #[test]
    fn test_instant_serializes_as_text() {
        let instant = CommitInstant::parse("20240101000000007").unwrap();
        let json = serde_json::to_string(&instant).unwrap();
        assert_eq!(json, "\"20240101000000007\"");
        let back: CommitInstant = serde_json::from_str(&json).unwrap();
        assert_eq!(back, instant);
    }

    #[test]
    fn test_commit_metadata_totals() {
        let mut partitions = BTreeMap::new();
        partitions.insert(
            PartitionPath::new("pair=XBTUSD".into()),
            PartitionStats { inserts: 2, updates: 1, deletes: 0 },
        );
        partitions.insert(
            PartitionPath::new("pair=ETHUSD".into()),
            PartitionStats { inserts: 1, updates: 0, deletes: 3 },
        );
        let meta = CommitMetadata {
            instant: CommitInstant::from_millis(0),
            operation: WriteMode::Upsert,
            partitions,
            total_records: 7,
        };
        assert_eq!((meta.inserts(), meta.updates(), meta.deletes()), (3, 1, 3));
    }
}
