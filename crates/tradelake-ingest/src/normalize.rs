//! Schema normalization
//!
//! Casts the declared fields of a raw record to their contract types and then
//! injects the configured literal columns. Undeclared fields pass through.
//! Normalization is idempotent: a normalized record fed back in comes out
//! unchanged, including columns injected by the first pass.

use chrono::{DateTime, NaiveDateTime};
use std::collections::BTreeSet;

use crate::config::{AdditionalColumns, FieldType, SchemaContract, TableConfig};
use crate::error::{IngestError, Result};
use crate::record::{parse_timestamp, FieldValue, NormalizedRecord, RawRecord};

/// One declared field as the normalizer sees it
#[derive(Debug, Clone)]
struct FieldRule {
    name: String,
    field_type: FieldType,
    required: bool,
}

/// Converts raw records to normalized records under a schema contract
#[derive(Debug, Clone)]
pub struct Normalizer {
    rules: Vec<FieldRule>,
    additional_columns: AdditionalColumns,
    /// When set, fields outside this set are dropped before casting
    projection: Option<BTreeSet<String>>,
}

impl Normalizer {
    /// Build a normalizer; additional columns may not shadow declared fields
    pub fn new(contract: &SchemaContract, additional_columns: AdditionalColumns) -> Result<Self> {
        for (name, _) in additional_columns.iter() {
            if contract.declares(name) {
                return Err(IngestError::config(format!(
                    "additional column '{}' collides with a declared schema field",
                    name
                )));
            }
        }

        let rules = contract
            .iter()
            .map(|(name, field_type)| FieldRule {
                name: name.to_string(),
                field_type,
                required: true,
            })
            .collect();

        Ok(Self {
            rules,
            additional_columns,
            projection: None,
        })
    }

    pub fn from_config(config: &TableConfig) -> Result<Self> {
        Self::new(&config.schema, config.additional_columns.clone())
    }

    /// Normalizer for delete batches.
    ///
    /// Only key and partition fields survive. Key fields keep their contract
    /// casts and stay mandatory; partition fields are cast when present.
    pub fn for_deletes(config: &TableConfig) -> Result<Self> {
        let keep: BTreeSet<String> = config
            .record_key_fields
            .iter()
            .chain(config.partition_fields.iter())
            .cloned()
            .collect();

        let rules = config
            .schema
            .iter()
            .filter(|(name, _)| keep.contains(*name))
            .map(|(name, field_type)| FieldRule {
                name: name.to_string(),
                field_type,
                required: config.record_key_fields.iter().any(|k| k == name),
            })
            .collect();

        let mut additional_columns = AdditionalColumns::none();
        for (name, value) in config.additional_columns.iter() {
            if keep.contains(name) {
                additional_columns = additional_columns.with(name, value.clone());
            }
        }

        let mut normalizer = Self::new(&SchemaContract::new(), additional_columns)?;
        normalizer.rules = rules;
        normalizer.projection = Some(keep);
        Ok(normalizer)
    }

    /// Cast declared fields without injecting additional columns
    pub fn cast(&self, raw: RawRecord) -> Result<NormalizedRecord> {
        let mut fields = raw.into_fields();

        if let Some(ref keep) = self.projection {
            fields.retain(|name, _| keep.contains(name));
        }

        for rule in &self.rules {
            match fields.get(&rule.name) {
                Some(value) => {
                    let cast = cast_value(&rule.name, value, rule.field_type)?;
                    fields.insert(rule.name.clone(), cast);
                },
                None if rule.required => {
                    return Err(IngestError::cast(&rule.name, "declared field is missing"));
                },
                None => {},
            }
        }

        Ok(NormalizedRecord::from_fields(fields))
    }

    /// Cast, then inject additional columns
    pub fn normalize(&self, raw: RawRecord) -> Result<NormalizedRecord> {
        let normalized = self.cast(raw)?;
        self.inject(normalized)
    }

    fn inject(&self, record: NormalizedRecord) -> Result<NormalizedRecord> {
        if self.additional_columns.is_empty() {
            return Ok(record);
        }

        let mut fields = record.into_raw().into_fields();
        for (name, value) in self.additional_columns.iter() {
            match fields.get(name) {
                // Already injected, e.g. a normalized record fed back in
                Some(existing) if existing == value => continue,
                Some(_) => {
                    return Err(IngestError::config(format!(
                        "additional column '{}' collides with an existing field",
                        name
                    )));
                },
                None => {},
            }
            fields.insert(name.to_string(), value.clone());
        }
        Ok(NormalizedRecord::from_fields(fields))
    }
}

/// Cast a single value to the target type
pub fn cast_value(field: &str, value: &FieldValue, target: FieldType) -> Result<FieldValue> {
    match target {
        FieldType::Timestamp => cast_timestamp(field, value).map(FieldValue::Timestamp),
        FieldType::Double => cast_double(field, value).map(FieldValue::Double),
        FieldType::String => match value {
            FieldValue::String(_) => Ok(value.clone()),
            other => other
                .render()
                .map(FieldValue::String)
                .ok_or_else(|| IngestError::cast(field, "value is null")),
        },
    }
}

fn cast_timestamp(field: &str, value: &FieldValue) -> Result<NaiveDateTime> {
    match value {
        FieldValue::Timestamp(ts) => Ok(*ts),
        FieldValue::Integer(secs) => epoch_to_timestamp(field, *secs),
        FieldValue::Double(secs) => epoch_float_to_timestamp(field, *secs),
        FieldValue::String(text) => {
            let text = text.trim();
            if let Ok(secs) = text.parse::<f64>() {
                return epoch_float_to_timestamp(field, secs);
            }
            parse_timestamp(text).ok_or_else(|| {
                IngestError::cast(field, format!("'{}' is not an epoch time or timestamp", text))
            })
        },
        FieldValue::Null => Err(IngestError::cast(field, "value is null")),
        other => Err(IngestError::cast(
            field,
            format!("cannot cast {} to timestamp", other.type_name()),
        )),
    }
}

/// Whole seconds only; fractional epoch seconds are truncated
fn epoch_float_to_timestamp(field: &str, secs: f64) -> Result<NaiveDateTime> {
    if !secs.is_finite() || secs.abs() >= i64::MAX as f64 {
        return Err(IngestError::cast(field, format!("epoch seconds {} out of range", secs)));
    }
    epoch_to_timestamp(field, secs.trunc() as i64)
}

fn epoch_to_timestamp(field: &str, secs: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp(secs, 0)
        .map(|dt| dt.naive_utc())
        .ok_or_else(|| IngestError::cast(field, format!("epoch seconds {} out of range", secs)))
}

fn cast_double(field: &str, value: &FieldValue) -> Result<f64> {
    let parsed = match value {
        FieldValue::Double(d) => *d,
        FieldValue::Integer(i) => *i as f64,
        FieldValue::String(text) => text.trim().parse::<f64>().map_err(|_| {
            IngestError::cast(field, format!("'{}' is not a number", text))
        })?,
        FieldValue::Null => return Err(IngestError::cast(field, "value is null")),
        other => {
            return Err(IngestError::cast(
                field,
                format!("cannot cast {} to double", other.type_name()),
            ))
        },
    };

    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(IngestError::cast(field, format!("{} is not a finite number", parsed)))
    }
}
