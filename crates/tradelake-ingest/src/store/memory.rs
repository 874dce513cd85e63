//! In-memory table store
//!
//! Holds every table in process memory. Besides backing tests, it can be told
//! to drop capabilities or to fail specific operations, and it counts the
//! calls it receives so callers can assert that nothing reached the store.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tradelake_common::TableId;

use super::state::{CatalogEntry, TableState};
use super::{
    CommitInstant, CommitMetadata, RetentionDirective, RetentionReport, StoreCapabilities,
    StoreError, StoreResult, StoredRecord, TableStore, WriteBatch,
};
use crate::catalog::CatalogSyncRequest;
use crate::record::{NormalizedRecord, PartitionPath, RecordKey};
use crate::router::WriteMode;

/// Operations that can be made to fail on demand
#[derive(Debug, Clone, Default)]
struct Faults {
    reject_commits: Option<String>,
    fail_retention: Option<String>,
    fail_catalog_sync: Option<String>,
}

#[derive(Debug, Default)]
pub struct InMemoryTableStore {
    tables: Mutex<HashMap<TableId, TableState>>,
    capabilities: StoreCapabilities,
    faults: Mutex<Faults>,
    calls: AtomicUsize,
}

impl InMemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capabilities(capabilities: StoreCapabilities) -> Self {
        Self {
            capabilities,
            ..Self::default()
        }
    }

    /// Reject every commit with `reason` until cleared
    pub async fn reject_commits(&self, reason: Option<&str>) {
        self.faults.lock().await.reject_commits = reason.map(String::from);
    }

    pub async fn fail_retention(&self, reason: Option<&str>) {
        self.faults.lock().await.fail_retention = reason.map(String::from);
    }

    pub async fn fail_catalog_sync(&self, reason: Option<&str>) {
        self.faults.lock().await.fail_catalog_sync = reason.map(String::from);
    }

    /// Number of trait calls received, capability queries excluded
    pub fn store_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Catalog request and partition list from the last successful sync
    pub async fn catalog_entry(&self, table: &TableId) -> Option<(CatalogSyncRequest, Vec<String>)> {
        let tables = self.tables.lock().await;
        tables
            .get(table)
            .and_then(|state| state.catalog.as_ref())
            .map(|CatalogEntry { request, partitions }| {
                (request.clone(), partitions.iter().cloned().collect())
            })
    }

    /// Number of commits moved off the active timeline so far
    pub async fn archived_commits(&self, table: &TableId) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map_or(0, |state| state.archived_commits)
    }

    /// Superseded record versions not yet reclaimed by the cleaner
    pub async fn superseded_versions(&self, table: &TableId) -> usize {
        let tables = self.tables.lock().await;
        tables.get(table).map_or(0, |state| state.superseded.len())
    }

    fn record_call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl TableStore for InMemoryTableStore {
    fn capabilities(&self) -> StoreCapabilities {
        self.capabilities
    }

    async fn start_commit(&self, table: &TableId, operation: WriteMode) -> StoreResult<CommitInstant> {
        self.record_call();
        let mut tables = self.tables.lock().await;
        tables
            .entry(table.clone())
            .or_default()
            .start_commit(&table.to_string(), operation)
    }

    async fn commit(
        &self,
        table: &TableId,
        instant: CommitInstant,
        batch: WriteBatch,
    ) -> StoreResult<CommitMetadata> {
        self.record_call();
        let reject = self.faults.lock().await.reject_commits.clone();

        let mut tables = self.tables.lock().await;
        let state = tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownInstant(instant.to_string()))?;

        if let Some(reason) = reject {
            state.abort_commit(instant)?;
            return Err(StoreError::Rejected(reason));
        }
        state.commit(instant, batch)
    }

    async fn abort_commit(&self, table: &TableId, instant: CommitInstant) -> StoreResult<()> {
        self.record_call();
        let mut tables = self.tables.lock().await;
        tables
            .get_mut(table)
            .ok_or_else(|| StoreError::UnknownInstant(instant.to_string()))?
            .abort_commit(instant)
    }

    async fn lookup(
        &self,
        table: &TableId,
        partition: &PartitionPath,
        key: &RecordKey,
    ) -> StoreResult<Option<NormalizedRecord>> {
        self.record_call();
        let tables = self.tables.lock().await;
        Ok(tables.get(table).and_then(|state| state.lookup(partition, key)))
    }

    async fn scan(&self, table: &TableId) -> StoreResult<Vec<StoredRecord>> {
        self.record_call();
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(TableState::scan).unwrap_or_default())
    }

    async fn commit_history(&self, table: &TableId) -> StoreResult<Vec<CommitMetadata>> {
        self.record_call();
        let tables = self.tables.lock().await;
        Ok(tables.get(table).map(|state| state.timeline.clone()).unwrap_or_default())
    }

    async fn apply_retention(
        &self,
        table: &TableId,
        directive: RetentionDirective,
    ) -> StoreResult<RetentionReport> {
        self.record_call();
        if let Some(reason) = self.faults.lock().await.fail_retention.clone() {
            return Err(StoreError::Rejected(reason));
        }

        let mut tables = self.tables.lock().await;
        Ok(tables
            .get_mut(table)
            .map(|state| state.apply_retention(directive))
            .unwrap_or_default())
    }

    async fn sync_catalog(&self, request: &CatalogSyncRequest) -> StoreResult<()> {
        self.record_call();
        if let Some(reason) = self.faults.lock().await.fail_catalog_sync.clone() {
            return Err(StoreError::Rejected(reason));
        }

        let mut tables = self.tables.lock().await;
        tables.entry(request.table.clone()).or_default().sync_catalog(request);
        Ok(())
    }
}
