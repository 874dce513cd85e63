//! Catalog synchronization instruction
//!
//! After a commit the pipeline asks the store to register the table and its
//! partitions with the metastore. Only the declarative request lives here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tradelake_common::TableId;

use crate::config::{PartitionExtractor, TableConfig};
use crate::record::PartitionPath;

/// "Sync this table" as handed to [`crate::store::TableStore::sync_catalog`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSyncRequest {
    pub table: TableId,
    pub base_path: PathBuf,
    pub partition_fields: Vec<String>,
    pub partition_extractor: PartitionExtractor,
    pub assume_date_partitioning: bool,
    pub hive_style_partitioning: bool,
}

impl CatalogSyncRequest {
    /// Request for `config`, or `None` when catalog sync is disabled
    pub fn for_table(config: &TableConfig) -> Option<Self> {
        if !config.catalog_sync.enabled {
            return None;
        }
        Some(Self {
            table: config.table.clone(),
            base_path: config.base_path.clone(),
            partition_fields: config.partition_fields.clone(),
            partition_extractor: config.catalog_sync.partition_extractor,
            assume_date_partitioning: config.catalog_sync.assume_date_partitioning,
            hive_style_partitioning: config.storage.hive_style_partitioning,
        })
    }

    /// Partition column values encoded in `path`, paired with their field names.
    ///
    /// Hive-style segments carry their own names; bare segments are matched
    /// to the partition fields by position.
    pub fn partition_values(&self, path: &PartitionPath) -> Vec<(String, String)> {
        if self.partition_extractor == PartitionExtractor::NonPartitioned {
            return Vec::new();
        }

        path.as_str()
            .split(PartitionPath::SEPARATOR)
            .zip(self.partition_fields.iter())
            .map(|(segment, field)| match segment.split_once('=') {
                Some((name, value)) if self.hive_style_partitioning => {
                    (name.to_string(), value.to_string())
                },
                _ => (field.clone(), segment.to_string()),
            })
            .collect()
    }

    /// Catalog partition spec, e.g. `pair='XBTUSD'`
    pub fn partition_spec(&self, path: &PartitionPath) -> String {
        self.partition_values(path)
            .into_iter()
            .map(|(name, value)| format!("{}='{}'", name, value))
            .collect::<Vec<_>>()
            .join(",")
    }
}
