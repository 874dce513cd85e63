//! Retention and compaction policy
//!
//! After every successful commit the policy looks at the length of the
//! table's commit history and issues a declarative [`RetentionDirective`]:
//! archive down to `min_commits` once the history grows past `max_commits`,
//! and run the cleaner once it holds more than `clean_trigger_commits`.
//! The store does the actual work.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use tradelake_common::TableId;

use crate::config::RetentionConfig;
use crate::store::{RetentionDirective, RetentionReport, TableStore};

// ============================================================================
// Lifecycle
// ============================================================================

/// Per-run table lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Writing,
    Committed,
    Cleaning,
    Failed,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;

        matches!(
            (self, next),
            (Idle, Writing)
                | (Writing, Committed)
                | (Writing, Failed)
                | (Committed, Cleaning)
                | (Committed, Idle)
                | (Cleaning, Idle)
                | (Failed, Idle)
        )
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("invalid lifecycle transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub to: LifecycleState,
}

/// Lifecycle of one run, with every state it passed through
#[derive(Debug, Clone)]
pub struct Lifecycle {
    history: Vec<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            history: vec![LifecycleState::Idle],
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.history.last().copied().unwrap_or(LifecycleState::Idle)
    }

    pub fn transition(&mut self, next: LifecycleState) -> Result<(), TransitionError> {
        let from = self.state();
        if !from.can_transition_to(next) {
            return Err(TransitionError { from, to: next });
        }
        debug!(from = ?from, to = ?next, "Lifecycle transition");
        self.history.push(next);
        Ok(())
    }

    pub fn history(&self) -> &[LifecycleState] {
        &self.history
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Policy
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    config: RetentionConfig,
}

impl RetentionPolicy {
    pub fn new(config: RetentionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Directive for a timeline holding `commits` completed commits
    pub fn plan(&self, commits: usize) -> RetentionDirective {
        let archive_to = (commits > self.config.max_commits).then_some(self.config.min_commits);
        RetentionDirective {
            archive_to,
            clean: commits > self.config.clean_trigger_commits,
            cleaner_commits_retained: self.config.cleaner_commits_retained,
        }
    }
}

/// Result of the post-commit retention step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetentionOutcome {
    Completed(RetentionReport),
    NothingToDo { commits: usize },
    /// Another cleanup on the same table was running
    Skipped,
    /// Handed to a background task
    Deferred,
    Failed { reason: String },
}

// ============================================================================
// Per-table cleanup guard
// ============================================================================

/// Tables with a cleanup pass in progress; clones share the same set
#[derive(Debug, Clone, Default)]
pub struct CleanupGuards {
    active: Arc<Mutex<HashSet<TableId>>>,
}

impl CleanupGuards {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim `table`, or `None` when a cleanup already holds it
    pub fn try_acquire(&self, table: &TableId) -> Option<CleanupPermit> {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if active.insert(table.clone()) {
            Some(CleanupPermit {
                table: table.clone(),
                active: Arc::clone(&self.active),
            })
        } else {
            None
        }
    }

    pub fn is_active(&self, table: &TableId) -> bool {
        let active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.contains(table)
    }
}

/// Releases the table's guard on drop
#[derive(Debug)]
pub struct CleanupPermit {
    table: TableId,
    active: Arc<Mutex<HashSet<TableId>>>,
}

impl Drop for CleanupPermit {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.table);
    }
}

// ============================================================================
// Runner
// ============================================================================

/// Drives the retention step against a store
#[derive(Clone)]
pub struct RetentionRunner {
    policy: RetentionPolicy,
    store: Arc<dyn TableStore>,
    guards: CleanupGuards,
}

impl RetentionRunner {
    pub fn new(policy: RetentionPolicy, store: Arc<dyn TableStore>, guards: CleanupGuards) -> Self {
        Self { policy, store, guards }
    }

    /// Run retention inline. Failures come back as an outcome, never an error.
    pub async fn run(&self, table: &TableId) -> RetentionOutcome {
        match self.guards.try_acquire(table) {
            Some(permit) => self.run_with_permit(table, permit).await,
            None => {
                warn!(table = %table, "Cleanup already running for table, skipping");
                RetentionOutcome::Skipped
            },
        }
    }

    /// Run retention on a spawned task; `None` when a cleanup already holds the table
    pub fn spawn(&self, table: &TableId) -> Option<JoinHandle<RetentionOutcome>> {
        let Some(permit) = self.guards.try_acquire(table) else {
            warn!(table = %table, "Cleanup already running for table, skipping");
            return None;
        };

        let runner = self.clone();
        let table = table.clone();
        Some(tokio::spawn(async move {
            runner.run_with_permit(&table, permit).await
        }))
    }

    async fn run_with_permit(&self, table: &TableId, _permit: CleanupPermit) -> RetentionOutcome {
        let commits = match self.store.commit_history(table).await {
            Ok(history) => history.len(),
            Err(e) => {
                warn!(table = %table, error = %e, "Could not read commit history for retention");
                return RetentionOutcome::Failed { reason: e.to_string() };
            },
        };

        let directive = self.policy.plan(commits);
        if directive.is_noop() {
            debug!(table = %table, commits, "Retention has nothing to do");
            return RetentionOutcome::NothingToDo { commits };
        }

        match self.store.apply_retention(table, directive).await {
            Ok(report) => {
                info!(
                    table = %table,
                    archived = report.archived_commits,
                    cleaned = report.cleaned_versions,
                    remaining = report.remaining_commits,
                    "Retention applied"
                );
                RetentionOutcome::Completed(report)
            },
            Err(e) => {
                warn!(table = %table, error = %e, "Retention failed, commit stands");
                RetentionOutcome::Failed { reason: e.to_string() }
            },
        }
    }
}
