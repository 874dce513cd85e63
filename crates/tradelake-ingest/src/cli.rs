//! Job arguments
//!
//! The host job runner passes `{input_path, output_path, database, table,
//! write_operation, additional_columns}`; everything else has table defaults.
//! Every flag can also come from a `TRADELAKE_*` environment variable.

use clap::Parser;
use std::path::PathBuf;
use tradelake_common::TableId;

use crate::config::{
    parse_field_list, AdditionalColumns, CastFailurePolicy, CatalogSyncConfig, RetentionConfig,
    TableConfig, ADDITIONAL_COLUMNS_NONE, DEFAULT_CLEANER_COMMITS_RETAINED,
    DEFAULT_CLEAN_TRIGGER_COMMITS, DEFAULT_MAX_COMMITS, DEFAULT_MIN_COMMITS, DEFAULT_PARALLELISM,
    DEFAULT_PARTITION_FIELDS, DEFAULT_PRECOMBINE_FIELD, DEFAULT_RECORD_KEY_FIELDS,
};
use crate::error::{IngestError, Result};
use crate::router::WriteMode;

/// Ingest a batch of trade records into a versioned, partitioned table
#[derive(Parser, Debug, Clone)]
#[command(name = "tradelake-ingest")]
#[command(author, version, about, long_about = None)]
pub struct JobArgs {
    /// File or directory holding the JSON batch
    #[arg(long, env = "TRADELAKE_INPUT_PATH")]
    pub input_path: PathBuf,

    /// Root under which the table lives at `<output_path>/<table>`
    #[arg(long, env = "TRADELAKE_OUTPUT_PATH")]
    pub output_path: PathBuf,

    /// Catalog database
    #[arg(long, alias = "glue-database", env = "TRADELAKE_DATABASE")]
    pub database: String,

    /// Table name
    #[arg(long, alias = "glue-table", env = "TRADELAKE_TABLE")]
    pub table: String,

    /// insert, upsert, bulk_insert or delete
    #[arg(long, env = "TRADELAKE_WRITE_OPERATION")]
    pub write_operation: String,

    /// JSON object of literal columns to add, or "none"
    #[arg(long, env = "TRADELAKE_ADDITIONAL_COLUMNS", default_value = ADDITIONAL_COLUMNS_NONE)]
    pub additional_columns: String,

    /// Comma-separated record key fields
    #[arg(long, env = "TRADELAKE_RECORD_KEY_FIELDS", default_value = DEFAULT_RECORD_KEY_FIELDS)]
    pub record_key_fields: String,

    /// Comma-separated partition fields
    #[arg(long, env = "TRADELAKE_PARTITION_FIELDS", default_value = DEFAULT_PARTITION_FIELDS)]
    pub partition_fields: String,

    #[arg(long, env = "TRADELAKE_PRECOMBINE_FIELD", default_value = DEFAULT_PRECOMBINE_FIELD)]
    pub precombine_field: String,

    #[arg(long, env = "TRADELAKE_MIN_COMMITS", default_value_t = DEFAULT_MIN_COMMITS)]
    pub min_commits: usize,

    #[arg(long, env = "TRADELAKE_MAX_COMMITS", default_value_t = DEFAULT_MAX_COMMITS)]
    pub max_commits: usize,

    #[arg(
        long,
        env = "TRADELAKE_CLEANER_COMMITS_RETAINED",
        default_value_t = DEFAULT_CLEANER_COMMITS_RETAINED
    )]
    pub cleaner_commits_retained: usize,

    #[arg(
        long,
        env = "TRADELAKE_CLEAN_TRIGGER_COMMITS",
        default_value_t = DEFAULT_CLEAN_TRIGGER_COMMITS
    )]
    pub clean_trigger_commits: usize,

    /// Run retention on a background task after the commit
    #[arg(long, env = "TRADELAKE_ASYNC_CLEAN")]
    pub async_clean: bool,

    /// Drop records that fail casting or keying instead of failing the batch
    #[arg(long, env = "TRADELAKE_DROP_INVALID_RECORDS")]
    pub drop_invalid_records: bool,

    /// Render partition paths as bare values instead of `field=value`
    #[arg(long, env = "TRADELAKE_NO_HIVE_STYLE_PARTITIONING")]
    pub no_hive_style_partitioning: bool,

    #[arg(long, env = "TRADELAKE_NO_CATALOG_SYNC")]
    pub no_catalog_sync: bool,

    /// Worker tasks for normalize/key/dedup
    #[arg(long, env = "TRADELAKE_PARALLELISM", default_value_t = DEFAULT_PARALLELISM)]
    pub parallelism: usize,

    /// Cancel the run if it has not committed after this many seconds
    #[arg(long, env = "TRADELAKE_TIMEOUT_SECS")]
    pub timeout_secs: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Validated job: everything needed before the first read
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub config: TableConfig,
    pub mode: WriteMode,
}

impl JobArgs {
    /// Resolve and validate; no file or store is touched
    pub fn resolve(&self) -> Result<JobSpec> {
        let mode: WriteMode = self.write_operation.parse()?;
        let table = TableId::new(&self.database, &self.table)
            .map_err(|e| IngestError::config(e.to_string()))?;

        let failure_policy = if self.drop_invalid_records {
            CastFailurePolicy::DropRecord
        } else {
            CastFailurePolicy::AbortBatch
        };

        let config = TableConfig::builder(table)
            .output_path(&self.output_path)
            .record_key_fields(parse_field_list(&self.record_key_fields))
            .partition_fields(parse_field_list(&self.partition_fields))
            .precombine_field(self.precombine_field.trim())
            .additional_columns(AdditionalColumns::parse(&self.additional_columns)?)
            .failure_policy(failure_policy)
            .hive_style_partitioning(!self.no_hive_style_partitioning)
            .retention(RetentionConfig {
                min_commits: self.min_commits,
                max_commits: self.max_commits,
                cleaner_commits_retained: self.cleaner_commits_retained,
                clean_trigger_commits: self.clean_trigger_commits,
                async_clean: self.async_clean,
            })
            .catalog_sync(CatalogSyncConfig {
                enabled: !self.no_catalog_sync,
                ..CatalogSyncConfig::default()
            })
            .parallelism(self.parallelism)
            .build()?;

        Ok(JobSpec { config, mode })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn args(extra: &[&str]) -> JobArgs {
        let mut argv = vec![
            "tradelake-ingest",
            "--input-path",
            "/in",
            "--output-path",
            "/out",
            "--glue-database",
            "crypto",
            "--glue-table",
            "kraken_trades",
        ];
        argv.extend_from_slice(extra);
        JobArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_resolves_job_defaults() {
        let job = args(&["--write-operation", "upsert"]).resolve().unwrap();
        assert_eq!(job.mode, WriteMode::Upsert);
        assert_eq!(job.config.table.to_string(), "crypto.kraken_trades");
        assert_eq!(job.config.base_path, PathBuf::from("/out/kraken_trades"));
        assert_eq!(job.config.retention.min_commits, 20);
        assert!(job.config.additional_columns.is_empty());
        assert!(job.config.catalog_sync.enabled);
    }

    #[test]
    fn test_invalid_write_operation_is_config_error() {
        let err = args(&["--write-operation", "merge"]).resolve().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_additional_columns_and_flags() {
        let job = args(&[
            "--write-operation",
            "bulk_insert",
            "--additional-columns",
            r#"{"exchange": "kraken"}"#,
            "--drop-invalid-records",
            "--no-hive-style-partitioning",
            "--min-commits",
            "2",
            "--max-commits",
            "3",
            "--cleaner-commits-retained",
            "1",
        ])
        .resolve()
        .unwrap();

        assert!(job.config.additional_columns.contains("exchange"));
        assert_eq!(job.config.failure_policy, CastFailurePolicy::DropRecord);
        assert!(!job.config.storage.hive_style_partitioning);
        assert_eq!(job.config.retention.max_commits, 3);
    }

    #[test]
    fn test_path_like_table_name_is_config_error() {
        let err = JobArgs::try_parse_from([
            "tradelake-ingest",
            "--input-path",
            "/in",
            "--output-path",
            "/out",
            "--database",
            "crypto",
            "--table",
            "../trades",
            "--write-operation",
            "insert",
        ])
        .unwrap()
        .resolve()
        .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_inverted_retention_rejected() {
        let err = args(&["--write-operation", "insert", "--min-commits", "30", "--max-commits", "20"])
            .resolve()
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }
}
