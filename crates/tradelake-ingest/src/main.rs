//! Tradelake Ingest - batch ingestion job

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tradelake_common::logging::{init_logging, LogConfig, LogLevel};
use tradelake_ingest::cli::JobArgs;
use tradelake_ingest::source::{BatchSource, JsonBatchSource};
use tradelake_ingest::store::LocalTableStore;
use tradelake_ingest::{IngestionPipeline, PipelineStatus};

#[tokio::main]
async fn main() -> Result<()> {
    // .env is optional
    let _ = dotenvy::dotenv();

    let args = JobArgs::parse();

    let log_level = if args.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    // Environment variables take precedence over the CLI defaults
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("tradelake-ingest")
        .build()
        .merge_env()?;

    let _guard = init_logging(&log_config)?;

    // Everything is validated before the input is read or the store is opened
    let job = args.resolve().context("Invalid job configuration")?;
    info!(
        table = %job.config.table,
        mode = %job.mode,
        input = %args.input_path.display(),
        base_path = %job.config.base_path.display(),
        "Starting ingestion job"
    );

    let cancel = CancellationToken::new();
    spawn_cancel_triggers(cancel.clone(), args.timeout_secs);

    let batch = JsonBatchSource::new(&args.input_path)
        .read_batch()
        .await
        .context("Failed to read input batch")?;

    let store = Arc::new(LocalTableStore::new(&args.output_path));
    let pipeline = IngestionPipeline::new(Arc::new(job.config), store)?;

    let status = pipeline.run(batch, job.mode, &cancel).await;
    for outcome in pipeline.wait_for_background().await {
        info!(outcome = ?outcome, "Background retention finished");
    }

    match status {
        PipelineStatus::Success(report) => {
            println!("{}", serde_json::to_string_pretty(&report)?);
            info!("Ingestion complete");
            Ok(())
        },
        PipelineStatus::Failed(e) => {
            error!(error = %e, kind = ?e.kind(), "Ingestion job failed");
            Err(anyhow::Error::new(e).context("Ingestion failed"))
        },
    }
}

/// Cancel the run on Ctrl-C or once the timeout elapses
fn spawn_cancel_triggers(cancel: CancellationToken, timeout_secs: Option<u64>) {
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling ingestion");
            on_signal.cancel();
        }
    });

    if let Some(secs) = timeout_secs {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if !cancel.is_cancelled() {
                warn!(timeout_secs = secs, "Timeout reached, cancelling ingestion");
                cancel.cancel();
            }
        });
    }
}
