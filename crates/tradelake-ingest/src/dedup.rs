//! Precombine deduplication
//!
//! Records sharing a `(partition, key)` pair collapse to the one with the
//! greatest precombine value. Equal precombine values are resolved by batch
//! order: the record seen last wins. Batch order is whatever the source
//! produced, so ties are counted and reported rather than hidden.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::TableConfig;
use crate::error::{IngestError, Result};
use crate::record::{DeleteKey, FieldValue, KeyedRecord, PartitionPath, RecordKey};

/// How equal precombine values are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Later position in the batch wins
    #[default]
    LastSeen,
}

/// Counters from one deduplication pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DedupStats {
    pub input_records: usize,
    pub output_records: usize,
    pub duplicates_removed: usize,
    /// Duplicate pairs decided by batch order rather than precombine value
    pub ties_resolved: usize,
}

impl DedupStats {
    pub fn merge(&mut self, other: DedupStats) {
        self.input_records += other.input_records;
        self.output_records += other.output_records;
        self.duplicates_removed += other.duplicates_removed;
        self.ties_resolved += other.ties_resolved;
    }
}

#[derive(Debug, Clone)]
pub struct Deduplicator {
    precombine_field: String,
    tie_break: TieBreak,
}

impl Deduplicator {
    pub fn new(precombine_field: impl Into<String>) -> Self {
        Self {
            precombine_field: precombine_field.into(),
            tie_break: TieBreak::LastSeen,
        }
    }

    pub fn from_config(config: &TableConfig) -> Self {
        Self::new(config.precombine_field.clone())
    }

    pub fn precombine_field(&self) -> &str {
        &self.precombine_field
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Pick the single winner among records that share a key
    pub fn resolve(&self, candidates: Vec<KeyedRecord>) -> Result<KeyedRecord> {
        let mut stats = DedupStats::default();
        self.resolve_group(candidates, &mut stats)
    }

    /// Deduplicate records of one partition, keeping first-occurrence order
    pub fn dedup_partition(
        &self,
        records: Vec<KeyedRecord>,
    ) -> Result<(Vec<KeyedRecord>, DedupStats)> {
        let mut stats = DedupStats {
            input_records: records.len(),
            ..DedupStats::default()
        };

        let mut order: Vec<(PartitionPath, RecordKey)> = Vec::new();
        let mut groups: HashMap<(PartitionPath, RecordKey), Vec<KeyedRecord>> = HashMap::new();

        for record in records {
            let id = (record.partition.clone(), record.key.clone());
            let group = groups.entry(id.clone()).or_default();
            if group.is_empty() {
                order.push(id);
            }
            group.push(record);
        }

        let mut winners = Vec::with_capacity(order.len());
        for id in order {
            if let Some(group) = groups.remove(&id) {
                winners.push(self.resolve_group(group, &mut stats)?);
            }
        }

        stats.output_records = winners.len();
        stats.duplicates_removed = stats.input_records - stats.output_records;
        Ok((winners, stats))
    }

    fn resolve_group(
        &self,
        mut candidates: Vec<KeyedRecord>,
        stats: &mut DedupStats,
    ) -> Result<KeyedRecord> {
        candidates.sort_by_key(|c| c.position);
        let mut candidates = candidates.into_iter();

        let mut winner = candidates.next().ok_or_else(|| {
            IngestError::key(&self.precombine_field, "no records to resolve")
        })?;
        self.precombine_value(&winner)?;

        for challenger in candidates {
            let challenger_value = self.precombine_value(&challenger)?;
            let winner_value = self.precombine_value(&winner)?;

            let ordering = challenger_value.precombine_cmp(winner_value).ok_or_else(|| {
                IngestError::key(
                    &self.precombine_field,
                    format!(
                        "cannot compare {} with {} for key {}",
                        challenger_value.type_name(),
                        winner_value.type_name(),
                        challenger.key
                    ),
                )
                .at_record(challenger.position)
            })?;

            match (ordering, self.tie_break) {
                (Ordering::Greater, _) => winner = challenger,
                (Ordering::Equal, TieBreak::LastSeen) => {
                    stats.ties_resolved += 1;
                    winner = challenger;
                },
                (Ordering::Less, _) => {},
            }
        }

        Ok(winner)
    }

    /// Fail with a `KeyError` when the record has no usable precombine value
    pub fn check_precombine(&self, record: &KeyedRecord) -> Result<()> {
        self.precombine_value(record).map(|_| ())
    }

    fn precombine_value<'a>(&self, record: &'a KeyedRecord) -> Result<&'a FieldValue> {
        match record.record.get(&self.precombine_field) {
            Some(value) if !value.is_null() => Ok(value),
            _ => Err(IngestError::key(
                &self.precombine_field,
                format!("precombine value is missing for key {}", record.key),
            )
            .at_record(record.position)),
        }
    }
}

/// Group keyed records by partition, preserving batch order inside each group
pub fn split_by_partition(records: Vec<KeyedRecord>) -> BTreeMap<PartitionPath, Vec<KeyedRecord>> {
    let mut partitions: BTreeMap<PartitionPath, Vec<KeyedRecord>> = BTreeMap::new();
    for record in records {
        partitions.entry(record.partition.clone()).or_default().push(record);
    }
    partitions
}

/// Collapse repeated tombstones, keeping first occurrence order
pub fn dedup_deletes(keys: Vec<DeleteKey>) -> (Vec<DeleteKey>, usize) {
    let total = keys.len();
    let mut seen = HashSet::with_capacity(total);
    let unique: Vec<DeleteKey> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
    let removed = total - unique.len();
    (unique, removed)
}
