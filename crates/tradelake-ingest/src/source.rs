//! Batch sources
//!
//! Reads the raw records of one batch from `input_path`: a single file, or a
//! directory whose files are read in name order. Hidden files and `_` marker
//! files are skipped and there is no recursion. A file may hold JSON Lines, a
//! JSON array of objects, or any concatenation of the two.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::record::RawRecord;

/// Source of one batch of raw records
#[async_trait]
pub trait BatchSource: Send + Sync {
    /// Human-readable origin, used in logs
    fn describe(&self) -> String;

    async fn read_batch(&self) -> Result<Vec<RawRecord>>;
}

/// JSON records from a file or a flat directory of files
#[derive(Debug, Clone)]
pub struct JsonBatchSource {
    path: PathBuf,
}

impl JsonBatchSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Files making up the batch, in read order
    pub async fn files(&self) -> Result<Vec<PathBuf>> {
        let metadata = tokio::fs::metadata(&self.path).await.map_err(|e| {
            IngestError::Source(format!("cannot read input path {}: {}", self.path.display(), e))
        })?;

        if metadata.is_file() {
            return Ok(vec![self.path.clone()]);
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let hidden = entry
                .file_name()
                .to_str()
                .is_none_or(|name| name.starts_with('.') || name.starts_with('_'));
            if hidden || !entry.file_type().await?.is_file() {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();
        Ok(files)
    }
}

#[async_trait]
impl BatchSource for JsonBatchSource {
    fn describe(&self) -> String {
        self.path.display().to_string()
    }

    async fn read_batch(&self) -> Result<Vec<RawRecord>> {
        let files = self.files().await?;
        let mut records = Vec::new();

        for file in &files {
            let text = tokio::fs::read_to_string(file).await.map_err(|e| {
                IngestError::Source(format!("cannot read {}: {}", file.display(), e))
            })?;
            let parsed = parse_records(&text, file)?;
            debug!(file = %file.display(), records = parsed.len(), "Read input file");
            records.extend(parsed);
        }

        info!(
            input = %self.describe(),
            files = files.len(),
            records = records.len(),
            "Read input batch"
        );
        Ok(records)
    }
}

/// Parse every JSON value in `text` into records
pub fn parse_records(text: &str, origin: &Path) -> Result<Vec<RawRecord>> {
    let mut records = Vec::new();

    for value in serde_json::Deserializer::from_str(text).into_iter::<Value>() {
        let value = value.map_err(|e| {
            IngestError::Source(format!(
                "{}: invalid JSON at line {} column {}: {}",
                origin.display(),
                e.line(),
                e.column(),
                e
            ))
        })?;

        match value {
            Value::Object(object) => records.push(RawRecord::from_json_object(object)),
            Value::Array(items) => {
                for (i, item) in items.into_iter().enumerate() {
                    let Value::Object(object) = item else {
                        return Err(IngestError::Source(format!(
                            "{}: array element {} is not an object",
                            origin.display(),
                            i
                        )));
                    };
                    records.push(RawRecord::from_json_object(object));
                }
            },
            other => {
                return Err(IngestError::Source(format!(
                    "{}: record is not a JSON object: {}",
                    origin.display(),
                    other
                )))
            },
        }
    }

    Ok(records)
}
