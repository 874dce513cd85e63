//! Error taxonomy for the ingestion pipeline

use thiserror::Error;

use crate::store::StoreError;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Every way an ingestion run can fail.
///
/// `Config` is checked before any I/O. `Cast` and `Key` are record-level and
/// go through the configured failure policy. `Write` is the store's verdict,
/// surfaced without retry.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Cast error on field '{field}': {reason}")]
    Cast { field: String, reason: String },

    #[error("Key error on field '{field}': {reason}")]
    Key { field: String, reason: String },

    #[error("Write error: {0}")]
    Write(#[from] StoreError),

    #[error("Source error: {0}")]
    Source(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Common(#[from] tradelake_common::TradelakeError),

    #[error("Ingestion cancelled before commit")]
    Cancelled,

    #[error("Worker task failed: {0}")]
    Worker(String),

    #[error("Record {index}: {source}")]
    Record {
        index: usize,
        #[source]
        source: Box<IngestError>,
    },
}

/// Coarse classification of an [`IngestError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Cast,
    Key,
    Write,
    Source,
    Cancelled,
    Internal,
}

impl IngestError {
    pub fn config(message: impl Into<String>) -> Self {
        IngestError::Config(message.into())
    }

    pub fn cast(field: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Cast {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn key(field: impl Into<String>, reason: impl Into<String>) -> Self {
        IngestError::Key {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Attach the batch position of the record that failed
    pub fn at_record(self, index: usize) -> Self {
        match self {
            IngestError::Record { .. } => self,
            other => IngestError::Record {
                index,
                source: Box::new(other),
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            IngestError::Config(_) => ErrorKind::Config,
            IngestError::Cast { .. } => ErrorKind::Cast,
            IngestError::Key { .. } => ErrorKind::Key,
            IngestError::Write(_) => ErrorKind::Write,
            IngestError::Source(_)
            | IngestError::Io(_)
            | IngestError::Serialization(_)
            | IngestError::Common(_) => ErrorKind::Source,
            IngestError::Cancelled => ErrorKind::Cancelled,
            IngestError::Worker(_) => ErrorKind::Internal,
            IngestError::Record { source, .. } => source.kind(),
        }
    }

    /// Field named by a cast or key error, looking through record context
    pub fn field(&self) -> Option<&str> {
        match self {
            IngestError::Cast { field, .. } | IngestError::Key { field, .. } => Some(field),
            IngestError::Record { source, .. } => source.field(),
            _ => None,
        }
    }

    /// Batch index of the failing record, when the failure is record-level
    pub fn record_index(&self) -> Option<usize> {
        match self {
            IngestError::Record { index, .. } => Some(*index),
            _ => None,
        }
    }
}
