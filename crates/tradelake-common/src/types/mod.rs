//! Common types used across tradelake

use crate::error::{Result, TradelakeError};
use serde::{Deserialize, Serialize};

/// Checksum algorithm type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl std::fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChecksumAlgorithm::Sha256 => write!(f, "sha256"),
            ChecksumAlgorithm::Sha512 => write!(f, "sha512"),
        }
    }
}

/// Identifies one table in the catalog.
///
/// Commits are serialized per `TableId`: at most one inflight write per
/// `(database, table)` pair.
///
/// # Examples
///
/// ```
/// use tradelake_common::types::TableId;
///
/// let id = TableId::new("crypto", "kraken_trades").unwrap();
/// assert_eq!(id.to_string(), "crypto.kraken_trades");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    /// Catalog database the table is registered in
    pub database: String,

    /// Table name, also the directory name under the output path
    pub table: String,
}

impl TableId {
    /// Creates a table identifier, rejecting empty or path-like names.
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Result<Self> {
        let database = database.into();
        let table = table.into();
        validate_identifier("database", &database)?;
        validate_identifier("table", &table)?;
        Ok(Self { database, table })
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

fn validate_identifier(kind: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(TradelakeError::InvalidIdentifier(format!("{} name cannot be empty", kind)));
    }
    if value.contains(['/', '\\', '.']) || value.chars().any(char::is_whitespace) {
        return Err(TradelakeError::InvalidIdentifier(format!(
            "{} name '{}' must not contain path separators, dots or whitespace",
            kind, value
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_table_id_display() {
        let id = TableId::new("glue_db", "trades").unwrap();
        assert_eq!(id.to_string(), "glue_db.trades");
    }

    #[test]
    fn test_table_id_rejects_bad_names() {
        assert!(TableId::new("", "trades").is_err());
        assert!(TableId::new("db", "../trades").is_err());
        assert!(TableId::new("db", "my trades").is_err());
    }
}
