//! Local snapshot table store
//!
//! Keeps each table as one snapshot file at
//! `<root>/<table>/.tradelake/table.json`: a `sha256:<hex>` header line
//! followed by the JSON state. Header and body are published by a single
//! rename, so a reader sees either the previous snapshot or the new one.
//! The checksum is verified on load; a mismatch is reported as corruption
//! rather than silently starting an empty table.
//!
//! Inflight instants are tracked in process only. Writers in different
//! processes are not coordinated.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use tradelake_common::checksum::{compute_bytes_checksum, verify_bytes_checksum};
use tradelake_common::types::ChecksumAlgorithm;
use tradelake_common::TableId;

use super::state::TableState;
use super::{
    CommitInstant, CommitMetadata, RetentionDirective, RetentionReport, StoreCapabilities,
    StoreError, StoreResult, StoredRecord, TableStore, WriteBatch,
};
use crate::catalog::CatalogSyncRequest;
use crate::record::{NormalizedRecord, PartitionPath, RecordKey};
use crate::router::WriteMode;

const METADATA_DIR: &str = ".tradelake";
const SNAPSHOT_FILE: &str = "table.json";
const TEMP_FILE: &str = "table.json.tmp";
const CHECKSUM_PREFIX: &str = "sha256:";

pub struct LocalTableStore {
    root: PathBuf,
    tables: Mutex<HashMap<TableId, TableState>>,
}

impl LocalTableStore {
    /// Store tables under `root`, one directory per table
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            tables: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn metadata_dir(&self, table: &TableId) -> PathBuf {
        self.root.join(&table.table).join(METADATA_DIR)
    }

    async fn load(&self, table: &TableId) -> StoreResult<TableState> {
        let dir = self.metadata_dir(table);
        let snapshot_path = dir.join(SNAPSHOT_FILE);

        let bytes = match tokio::fs::read(&snapshot_path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(table = %table, "No snapshot yet, starting empty table");
                return Ok(TableState::default());
            },
            Err(e) => return Err(e.into()),
        };

        let (expected, body) = split_header(&bytes).ok_or_else(|| {
            StoreError::Corrupt(format!("{}: missing checksum header", snapshot_path.display()))
        })?;
        verify_bytes_checksum(body, expected, ChecksumAlgorithm::Sha256)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", snapshot_path.display(), e)))?;

        let state: TableState = serde_json::from_slice(body)
            .map_err(|e| StoreError::Corrupt(format!("{}: {}", snapshot_path.display(), e)))?;

        info!(
            table = %table,
            commits = state.timeline.len(),
            partitions = state.partitions.len(),
            "Loaded table snapshot"
        );
        Ok(state)
    }

    /// Write header and state to a temp file, then rename it into place
    async fn persist(&self, table: &TableId, state: &TableState) -> StoreResult<()> {
        let dir = self.metadata_dir(table);
        tokio::fs::create_dir_all(&dir).await?;

        let body = serde_json::to_vec_pretty(state)
            .map_err(|e| StoreError::Corrupt(format!("snapshot not serializable: {}", e)))?;
        let checksum = compute_bytes_checksum(&body, ChecksumAlgorithm::Sha256);

        let mut bytes = format!("{}{}\n", CHECKSUM_PREFIX, checksum).into_bytes();
        bytes.extend_from_slice(&body);

        write_atomic(&dir.join(TEMP_FILE), &dir.join(SNAPSHOT_FILE), &bytes).await?;

        debug!(table = %table, size_bytes = bytes.len(), checksum = %checksum, "Persisted table snapshot");
        Ok(())
    }

    /// Run `f` against the table state, loading it on first use
    async fn with_state<T>(
        &self,
        table: &TableId,
        f: impl FnOnce(&mut TableState) -> T,
    ) -> StoreResult<T> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(table) {
            let state = self.load(table).await?;
            tables.insert(table.clone(), state);
        }
        match tables.get_mut(table) {
            Some(state) => Ok(f(state)),
            None => Err(StoreError::Corrupt(format!("table {} vanished from cache", table))),
        }
    }

    /// Apply a mutation to a copy, persist it, then publish it
    async fn mutate<T>(
        &self,
        table: &TableId,
        f: impl FnOnce(&mut TableState) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut tables = self.tables.lock().await;
        if !tables.contains_key(table) {
            let state = self.load(table).await?;
            tables.insert(table.clone(), state);
        }
        let Some(current) = tables.get_mut(table) else {
            return Err(StoreError::Corrupt(format!("table {} vanished from cache", table)));
        };

        let mut next = current.clone();
        let outcome = f(&mut next);

        match outcome {
            Ok(value) => match self.persist(table, &next).await {
                Ok(()) => {
                    *current = next;
                    Ok(value)
                },
                Err(e) => {
                    current.inflight = None;
                    Err(e)
                },
            },
            Err(e) => {
                current.inflight = next.inflight;
                Err(e)
            },
        }
    }
}

/// `sha256:<hex>` header and JSON body of a snapshot file
fn split_header(bytes: &[u8]) -> Option<(&str, &[u8])> {
    let newline = bytes.iter().position(|b| *b == b'\n')?;
    let header = std::str::from_utf8(&bytes[..newline]).ok()?;
    let checksum = header.strip_prefix(CHECKSUM_PREFIX)?;
    Some((checksum, &bytes[newline + 1..]))
}

async fn write_atomic(temp_path: &Path, path: &Path, bytes: &[u8]) -> StoreResult<()> {
    let mut file = tokio::fs::File::create(temp_path).await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    tokio::fs::rename(temp_path, path).await?;
    Ok(())
}

#[async_trait]
impl TableStore for LocalTableStore {
    fn capabilities(&self) -> StoreCapabilities {
        StoreCapabilities::full()
    }

    async fn start_commit(&self, table: &TableId, operation: WriteMode) -> StoreResult<CommitInstant> {
        let name = table.to_string();
        self.with_state(table, |state| state.start_commit(&name, operation))
            .await?
    }

    async fn commit(
        &self,
        table: &TableId,
        instant: CommitInstant,
        batch: WriteBatch,
    ) -> StoreResult<CommitMetadata> {
        self.mutate(table, |state| state.commit(instant, batch)).await
    }

    async fn abort_commit(&self, table: &TableId, instant: CommitInstant) -> StoreResult<()> {
        self.with_state(table, |state| state.abort_commit(instant)).await?
    }

    async fn lookup(
        &self,
        table: &TableId,
        partition: &PartitionPath,
        key: &RecordKey,
    ) -> StoreResult<Option<NormalizedRecord>> {
        self.with_state(table, |state| state.lookup(partition, key)).await
    }

    async fn scan(&self, table: &TableId) -> StoreResult<Vec<StoredRecord>> {
        self.with_state(table, |state| state.scan()).await
    }

    async fn commit_history(&self, table: &TableId) -> StoreResult<Vec<CommitMetadata>> {
        self.with_state(table, |state| state.timeline.clone()).await
    }

    async fn apply_retention(
        &self,
        table: &TableId,
        directive: RetentionDirective,
    ) -> StoreResult<RetentionReport> {
        self.mutate(table, |state| Ok(state.apply_retention(directive))).await
    }

    async fn sync_catalog(&self, request: &CatalogSyncRequest) -> StoreResult<()> {
        self.mutate(&request.table, |state| {
            state.sync_catalog(request);
            Ok(())
        })
        .await
    }
}
