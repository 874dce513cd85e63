//! Table and job configuration
//!
//! A [`TableConfig`] is resolved once per job invocation, validated, and then
//! shared read-only (`Arc<TableConfig>`) by every pipeline stage.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tradelake_common::TableId;

use crate::error::{IngestError, Result};
use crate::record::FieldValue;

// ============================================================================
// Defaults
// ============================================================================

/// Record key fields of the trades table.
pub const DEFAULT_RECORD_KEY_FIELDS: &str = "transaction_id,close_time";

/// Partition field of the trades table.
pub const DEFAULT_PARTITION_FIELDS: &str = "pair";

/// Precombine field of the trades table.
pub const DEFAULT_PRECOMBINE_FIELD: &str = "transaction_id";

/// Sentinel meaning "no additional columns".
pub const ADDITIONAL_COLUMNS_NONE: &str = "none";

pub const DEFAULT_MIN_COMMITS: usize = 20;
pub const DEFAULT_MAX_COMMITS: usize = 30;
pub const DEFAULT_CLEANER_COMMITS_RETAINED: usize = 10;
pub const DEFAULT_CLEAN_TRIGGER_COMMITS: usize = 10;
pub const DEFAULT_PARALLELISM: usize = 4;

// ============================================================================
// Schema contract
// ============================================================================

/// Target type of a declared field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    Timestamp,
    Double,
    String,
}

impl std::str::FromStr for FieldType {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "timestamp" => Ok(FieldType::Timestamp),
            "double" => Ok(FieldType::Double),
            "string" => Ok(FieldType::String),
            other => Err(IngestError::config(format!("Unsupported field type '{}'", other))),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FieldType::Timestamp => write!(f, "timestamp"),
            FieldType::Double => write!(f, "double"),
            FieldType::String => write!(f, "string"),
        }
    }
}

/// Ordered mapping of declared field → target type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaContract {
    fields: Vec<(String, FieldType)>,
}

impl SchemaContract {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Casts applied to exchange trade exports: epoch times and decimal strings
    pub fn trades() -> Self {
        Self::new()
            .field("close_time", FieldType::Timestamp)
            .field("open_time", FieldType::Timestamp)
            .field("fee", FieldType::Double)
            .field("price", FieldType::Double)
            .field("volume", FieldType::Double)
    }

    /// Declare a field, replacing an earlier declaration of the same name
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        let name = name.into();
        self.fields.retain(|(existing, _)| *existing != name);
        self.fields.push((name, field_type));
        self
    }

    pub fn get(&self, name: &str) -> Option<FieldType> {
        self.fields
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, field_type)| *field_type)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FieldType)> {
        self.fields.iter().map(|(name, t)| (name.as_str(), *t))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl Default for SchemaContract {
    fn default() -> Self {
        Self::trades()
    }
}

// ============================================================================
// Additional columns
// ============================================================================

/// Literal columns injected into every record after casting
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdditionalColumns {
    columns: BTreeMap<String, FieldValue>,
}

impl AdditionalColumns {
    pub fn none() -> Self {
        Self::default()
    }

    /// Parse the job argument: the `"none"` sentinel, or a JSON object of scalars
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case(ADDITIONAL_COLUMNS_NONE) {
            return Ok(Self::none());
        }

        let value: serde_json::Value = serde_json::from_str(raw).map_err(|e| {
            IngestError::config(format!("additional_columns is not valid JSON: {}", e))
        })?;
        let serde_json::Value::Object(object) = value else {
            return Err(IngestError::config("additional_columns must be a JSON object"));
        };

        let mut columns = BTreeMap::new();
        for (name, value) in object {
            if name.trim().is_empty() {
                return Err(IngestError::config("additional column name cannot be empty"));
            }
            if value.is_array() || value.is_object() {
                return Err(IngestError::config(format!(
                    "additional column '{}' must be a scalar literal",
                    name
                )));
            }
            columns.insert(name, FieldValue::from_json(value));
        }
        Ok(Self { columns })
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.columns.insert(name.into(), value.into());
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }
}

// ============================================================================
// Policies and storage parameters
// ============================================================================

/// What to do with a record that fails casting or keying
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CastFailurePolicy {
    /// Fail the whole batch on the first bad record
    #[default]
    AbortBatch,
    /// Skip the record and keep going
    DropRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TableType {
    #[default]
    CopyOnWrite,
    MergeOnRead,
}

/// Physical storage parameters passed through to the table store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub table_type: TableType,
    pub compression_codec: String,
    pub hive_style_partitioning: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            table_type: TableType::CopyOnWrite,
            compression_codec: "snappy".to_string(),
            hive_style_partitioning: true,
        }
    }
}

/// Commit retention and cleaner thresholds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Never archive the timeline below this many commits
    pub min_commits: usize,
    /// Archive once the timeline grows past this many commits
    pub max_commits: usize,
    /// Commits whose superseded record versions the cleaner keeps
    pub cleaner_commits_retained: usize,
    /// Run the cleaner once the timeline holds more than this many commits
    pub clean_trigger_commits: usize,
    /// Run retention on a background task instead of inline
    pub async_clean: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            min_commits: DEFAULT_MIN_COMMITS,
            max_commits: DEFAULT_MAX_COMMITS,
            cleaner_commits_retained: DEFAULT_CLEANER_COMMITS_RETAINED,
            clean_trigger_commits: DEFAULT_CLEAN_TRIGGER_COMMITS,
            async_clean: false,
        }
    }
}

impl RetentionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_commits == 0 {
            return Err(IngestError::config("min_commits must be greater than 0"));
        }
        if self.max_commits <= self.min_commits {
            return Err(IngestError::config(format!(
                "max_commits ({}) must be greater than min_commits ({})",
                self.max_commits, self.min_commits
            )));
        }
        if self.cleaner_commits_retained >= self.min_commits {
            return Err(IngestError::config(format!(
                "cleaner_commits_retained ({}) must be less than min_commits ({})",
                self.cleaner_commits_retained, self.min_commits
            )));
        }
        Ok(())
    }
}

/// How partition values are read back out of the partition path by the catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PartitionExtractor {
    #[default]
    MultiPartKeysValue,
    NonPartitioned,
}

/// Catalog synchronization settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSyncConfig {
    pub enabled: bool,
    pub partition_extractor: PartitionExtractor,
    /// Partition values are never read as dates
    pub assume_date_partitioning: bool,
}

impl Default for CatalogSyncConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            partition_extractor: PartitionExtractor::MultiPartKeysValue,
            assume_date_partitioning: false,
        }
    }
}

// ============================================================================
// Table configuration
// ============================================================================

/// Immutable per-run configuration of the target table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    pub table: TableId,
    /// `output_path/table`
    pub base_path: PathBuf,
    pub record_key_fields: Vec<String>,
    pub partition_fields: Vec<String>,
    pub precombine_field: String,
    pub schema: SchemaContract,
    pub additional_columns: AdditionalColumns,
    pub failure_policy: CastFailurePolicy,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub catalog_sync: CatalogSyncConfig,
    /// Worker tasks used by the normalize/key/dedup stages
    pub parallelism: usize,
}

impl TableConfig {
    pub fn builder(table: TableId) -> TableConfigBuilder {
        TableConfigBuilder::new(table)
    }

    pub fn validate(&self) -> Result<()> {
        validate_field_list("record key", &self.record_key_fields)?;
        validate_field_list("partition", &self.partition_fields)?;

        if self.precombine_field.trim().is_empty() {
            return Err(IngestError::config("precombine field cannot be empty"));
        }

        for (name, _) in self.additional_columns.iter() {
            if self.schema.declares(name) {
                return Err(IngestError::config(format!(
                    "additional column '{}' collides with a declared schema field",
                    name
                )));
            }
        }

        self.retention.validate()?;

        if self.parallelism == 0 {
            return Err(IngestError::config("parallelism must be greater than 0"));
        }
        if self.storage.compression_codec.trim().is_empty() {
            return Err(IngestError::config("compression codec cannot be empty"));
        }
        Ok(())
    }
}

fn validate_field_list(kind: &str, fields: &[String]) -> Result<()> {
    if fields.is_empty() {
        return Err(IngestError::config(format!("at least one {} field is required", kind)));
    }
    for (i, field) in fields.iter().enumerate() {
        if field.trim().is_empty() {
            return Err(IngestError::config(format!("{} field names cannot be empty", kind)));
        }
        if fields[..i].contains(field) {
            return Err(IngestError::config(format!(
                "{} field '{}' is listed twice",
                kind, field
            )));
        }
    }
    Ok(())
}

/// Split a comma-separated field list, dropping blanks
pub fn parse_field_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(String::from)
        .collect()
}

/// Builder for [`TableConfig`]; `build` validates
pub struct TableConfigBuilder {
    config: TableConfig,
}

impl TableConfigBuilder {
    fn new(table: TableId) -> Self {
        let base_path = PathBuf::from(&table.table);
        Self {
            config: TableConfig {
                table,
                base_path,
                record_key_fields: parse_field_list(DEFAULT_RECORD_KEY_FIELDS),
                partition_fields: parse_field_list(DEFAULT_PARTITION_FIELDS),
                precombine_field: DEFAULT_PRECOMBINE_FIELD.to_string(),
                schema: SchemaContract::trades(),
                additional_columns: AdditionalColumns::none(),
                failure_policy: CastFailurePolicy::AbortBatch,
                storage: StorageConfig::default(),
                retention: RetentionConfig::default(),
                catalog_sync: CatalogSyncConfig::default(),
                parallelism: DEFAULT_PARALLELISM,
            },
        }
    }

    /// Place the table under `output_path/<table>`
    pub fn output_path(mut self, output_path: impl AsRef<Path>) -> Self {
        self.config.base_path = output_path.as_ref().join(&self.config.table.table);
        self
    }

    pub fn record_key_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.record_key_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn partition_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.partition_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    pub fn precombine_field(mut self, field: impl Into<String>) -> Self {
        self.config.precombine_field = field.into();
        self
    }

    pub fn schema(mut self, schema: SchemaContract) -> Self {
        self.config.schema = schema;
        self
    }

    pub fn additional_columns(mut self, columns: AdditionalColumns) -> Self {
        self.config.additional_columns = columns;
        self
    }

    pub fn failure_policy(mut self, policy: CastFailurePolicy) -> Self {
        self.config.failure_policy = policy;
        self
    }

    pub fn storage(mut self, storage: StorageConfig) -> Self {
        self.config.storage = storage;
        self
    }

    pub fn hive_style_partitioning(mut self, enabled: bool) -> Self {
        self.config.storage.hive_style_partitioning = enabled;
        self
    }

    pub fn retention(mut self, retention: RetentionConfig) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn catalog_sync(mut self, catalog_sync: CatalogSyncConfig) -> Self {
        self.config.catalog_sync = catalog_sync;
        self
    }

    pub fn parallelism(mut self, parallelism: usize) -> Self {
        self.config.parallelism = parallelism;
        self
    }

    pub fn build(self) -> Result<TableConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}
