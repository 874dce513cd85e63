//! Tradelake Ingest Library
//!
//! Ingestion policy layer for a partitioned, versioned table store.
//!
//! # Pipeline
//!
//! A batch of raw JSON records flows through:
//!
//! - **Normalizer** ([`normalize`]): casts declared fields and injects literal columns
//! - **Record keyer** ([`keyer`]): derives the record key and partition path
//! - **Deduplicator** ([`dedup`]): keeps the record with the greatest precombine value per key
//! - **Write router** ([`router`]): applies the batch as one commit under a write mode
//! - **Retention** ([`retention`]): bounds the commit history after each commit
//!
//! [`pipeline::IngestionPipeline`] runs all of them and returns one
//! [`pipeline::PipelineStatus`]. The storage engine sits behind
//! [`store::TableStore`].
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use tradelake_common::TableId;
//! use tradelake_ingest::config::TableConfig;
//! use tradelake_ingest::pipeline::IngestionPipeline;
//! use tradelake_ingest::record::RawRecord;
//! use tradelake_ingest::router::WriteMode;
//! use tradelake_ingest::store::InMemoryTableStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TableConfig::builder(TableId::new("crypto", "trades")?).build()?;
//!     let pipeline = IngestionPipeline::new(Arc::new(config), Arc::new(InMemoryTableStore::new()))?;
//!
//!     let batch = vec![RawRecord::new().with("transaction_id", "T1")];
//!     let status = pipeline.run(batch, WriteMode::Upsert, &CancellationToken::new()).await;
//!     println!("success: {}", status.is_success());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod catalog;
pub mod cli;
pub mod config;
pub mod dedup;
pub mod error;
pub mod keyer;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod retention;
pub mod router;
pub mod source;
pub mod store;

// Re-export commonly used types
pub use error::{ErrorKind, IngestError, Result};
pub use pipeline::{IngestReport, IngestionPipeline, PipelineStatus};
pub use router::WriteMode;
