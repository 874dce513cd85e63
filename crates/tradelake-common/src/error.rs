//! Error types shared across tradelake crates

use thiserror::Error;

/// Result type alias for shared utilities
pub type Result<T> = std::result::Result<T, TradelakeError>;

/// Error raised by the shared utilities (checksums, snapshot files, identifiers)
#[derive(Error, Debug)]
pub enum TradelakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),
}
