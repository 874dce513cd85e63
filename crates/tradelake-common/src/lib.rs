//! Tradelake Common Library
//!
//! Shared types, utilities, and error handling for the tradelake workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`TradelakeError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: integrity checks for persisted table snapshots
//! - **Types**: identifiers shared by the ingest crate and its stores
//!
//! # Example
//!
//! ```no_run
//! use tradelake_common::checksum::compute_bytes_checksum;
//! use tradelake_common::types::ChecksumAlgorithm;
//!
//! let digest = compute_bytes_checksum(b"snapshot", ChecksumAlgorithm::Sha256);
//! println!("snapshot checksum: {}", digest);
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, TradelakeError};
pub use types::TableId;
