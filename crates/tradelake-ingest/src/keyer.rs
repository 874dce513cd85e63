//! Record key and partition path derivation
//!
//! Keys are `field:value` pairs in declared order joined by `,`; partition
//! paths are `field=value` segments (or bare values) joined by `/`. Both are
//! pure functions of the field values, so re-ingesting the same input lands
//! on the same keys.

use crate::config::TableConfig;
use crate::error::{IngestError, Result};
use crate::record::{DeleteKey, KeyedRecord, NormalizedRecord, PartitionPath, RecordKey};

#[derive(Debug, Clone)]
pub struct RecordKeyer {
    key_fields: Vec<String>,
    partition_fields: Vec<String>,
    hive_style: bool,
}

impl RecordKeyer {
    pub fn new(key_fields: Vec<String>, partition_fields: Vec<String>, hive_style: bool) -> Self {
        Self {
            key_fields,
            partition_fields,
            hive_style,
        }
    }

    pub fn from_config(config: &TableConfig) -> Self {
        Self::new(
            config.record_key_fields.clone(),
            config.partition_fields.clone(),
            config.storage.hive_style_partitioning,
        )
    }

    pub fn record_key(&self, record: &NormalizedRecord) -> Result<RecordKey> {
        let mut rendered = String::new();
        for (i, field) in self.key_fields.iter().enumerate() {
            let value = field_text(record, field, RecordKey::DELIMITER)?;
            if i > 0 {
                rendered.push(RecordKey::DELIMITER);
            }
            rendered.push_str(field);
            rendered.push(':');
            rendered.push_str(&value);
        }
        Ok(RecordKey::new(rendered))
    }

    pub fn partition_path(&self, record: &NormalizedRecord) -> Result<PartitionPath> {
        let segments = self
            .partition_fields
            .iter()
            .map(|field| {
                let value = field_text(record, field, PartitionPath::SEPARATOR)?;
                Ok(if self.hive_style {
                    format!("{}={}", field, value)
                } else {
                    value
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let separator = PartitionPath::SEPARATOR.to_string();
        Ok(PartitionPath::new(segments.join(separator.as_str())))
    }

    /// Key a normalized record at `position` in the batch
    pub fn key(&self, record: NormalizedRecord, position: usize) -> Result<KeyedRecord> {
        let key = self.record_key(&record)?;
        let partition = self.partition_path(&record)?;
        Ok(KeyedRecord {
            key,
            partition,
            record,
            position,
        })
    }

    /// Key a delete request; partition fields may be absent all together
    pub fn delete_key(&self, record: &NormalizedRecord) -> Result<DeleteKey> {
        let key = self.record_key(record)?;

        let present = self
            .partition_fields
            .iter()
            .filter(|field| record.get(field).is_some_and(|v| !v.is_null()))
            .count();

        let partition = match present {
            0 => None,
            n if n == self.partition_fields.len() => Some(self.partition_path(record)?),
            _ => {
                let missing = self
                    .partition_fields
                    .iter()
                    .find(|field| record.get(field).is_none_or(|v| v.is_null()))
                    .map(String::as_str)
                    .unwrap_or_default();
                return Err(IngestError::key(
                    missing,
                    "delete names some partition fields but not all",
                ));
            },
        };

        Ok(DeleteKey { key, partition })
    }
}

fn field_text(record: &NormalizedRecord, field: &str, reserved: char) -> Result<String> {
    let value = record
        .get(field)
        .ok_or_else(|| IngestError::key(field, "field is missing"))?;
    let text = value
        .render()
        .ok_or_else(|| IngestError::key(field, "value is null"))?;

    if text.is_empty() {
        return Err(IngestError::key(field, "value is empty"));
    }
    if text.contains(reserved) {
        return Err(IngestError::key(
            field,
            format!("value '{}' contains reserved delimiter '{}'", text, reserved),
        ));
    }
    Ok(text)
}
