//! Export worker
//!
//! A worker runs one job at a time: it creates the output file, drives a
//! streamed export into it and reports the terminal state back to the
//! coordinator. Partial output is removed when the job fails or is canceled.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ExportConfig;
use crate::error::{ExportError, Result};

use super::job::{ExportItem, ExportStatus};
use super::notifier::{ExportNotification, Notifier};
use super::source::HitSource;
use super::streaming::StreamedExport;
use super::writers::OutputWriter;

/// Terminal state of one job, sent back to the coordinator
#[derive(Debug)]
pub struct WorkerReport {
    /// Index of the worker slot that ran the job
    pub worker_id: usize,
    pub status: ExportStatus,
    pub error: String,
    pub rows: u64,
    pub size_bytes: u64,
    /// The slot's cancel receiver, handed back for reuse
    pub cancel_rx: Option<mpsc::Receiver<()>>,
}

impl WorkerReport {
    /// Report for a worker task that died without reporting
    pub fn failed(worker_id: usize, message: String) -> Self {
        Self {
            worker_id,
            status: ExportStatus::Error,
            error: message,
            rows: 0,
            size_bytes: 0,
            cancel_rx: None,
        }
    }
}

/// Successful or canceled run
enum RunEnd {
    Done { rows: u64, size_bytes: u64 },
    Canceled { rows: u64 },
}

/// One execution slot of the pool
pub struct ExportWorker {
    id: usize,
    output_dir: PathBuf,
    source: Arc<dyn HitSource>,
    notifier: Arc<dyn Notifier>,
    batch_size: usize,
    channel_capacity: usize,
}

impl ExportWorker {
    /// Create worker `id` writing into the configured output directory
    pub fn new(
        id: usize,
        config: &ExportConfig,
        source: Arc<dyn HitSource>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            id,
            output_dir: config.output_dir.clone(),
            source,
            notifier,
            batch_size: config.batch_size,
            channel_capacity: config.channel_capacity,
        }
    }

    /// Run one job to a terminal state
    ///
    /// # Arguments
    /// * `item` - Job to run, already marked running by the coordinator
    /// * `cancel_rx` - Cancel signals for this slot
    /// * `ctx` - Coordinator token; cancelling it cancels the job
    ///
    /// # Returns
    /// * `WorkerReport` - Terminal status, handing `cancel_rx` back
    pub async fn start(
        &self,
        item: ExportItem,
        mut cancel_rx: mpsc::Receiver<()>,
        ctx: CancellationToken,
    ) -> WorkerReport {
        let started = Instant::now();
        info!(
            worker = self.id,
            job = %item.id,
            custom = item.payload.is_custom(),
            "Processing export {}",
            item.file_name
        );

        if item.notify {
            let notification = ExportNotification::for_item(&item, ExportStatus::Running);
            if let Err(e) = self.notifier.notify(notification) {
                warn!(job = %item.id, "Failed to send start notification: {}", e);
            }
        }

        let job_token = ctx.child_token();
        let result = {
            let run = self.run(&item, job_token.clone());
            tokio::pin!(run);
            loop {
                tokio::select! {
                    result = &mut run => break result,
                    Some(()) = cancel_rx.recv(), if !job_token.is_cancelled() => {
                        info!(worker = self.id, job = %item.id, "Cancel requested");
                        job_token.cancel();
                    }
                }
            }
        };

        // Stale signals must not cancel the next job on this slot
        while cancel_rx.try_recv().is_ok() {}

        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (status, message, rows, size_bytes) = match result {
            Ok(RunEnd::Done { rows, size_bytes }) => {
                info!(
                    worker = self.id,
                    job = %item.id,
                    "Export {} done: {} rows, {} bytes, {} ms",
                    item.file_name,
                    rows,
                    size_bytes,
                    elapsed_ms
                );
                (ExportStatus::Done, String::new(), rows, size_bytes)
            }
            Ok(RunEnd::Canceled { rows }) => {
                info!(worker = self.id, job = %item.id, "Export {} canceled", item.file_name);
                (ExportStatus::Canceled, String::new(), rows, 0)
            }
            Err(e) => {
                error!(worker = self.id, job = %item.id, "Export {} failed: {}", item.file_name, e);
                (ExportStatus::Error, e.job_message(), 0, 0)
            }
        };

        WorkerReport {
            worker_id: self.id,
            status,
            error: message,
            rows,
            size_bytes,
            cancel_rx: Some(cancel_rx),
        }
    }

    async fn run(&self, item: &ExportItem, token: CancellationToken) -> Result<RunEnd> {
        let path = self.output_dir.join(&item.file_name);
        if path.exists() {
            return Err(ExportError::OutputExists(path.display().to_string()));
        }

        let writer = OutputWriter::create(&path, !item.params.uncompressed_output)?;

        let outcome = StreamedExport::new(self.source.clone(), &item.payload, item.params.clone())
            .with_extra(item.extra.clone())
            .with_batch_size(self.batch_size)
            .with_channel_capacity(self.channel_capacity)
            .with_cancellation(token)
            .run(writer)
            .await;

        let finished = match outcome.sink {
            Some(writer) => writer.finish().map_err(ExportError::Sink),
            None => Ok(()),
        };

        let failed = outcome.error.is_some() || outcome.canceled || finished.is_err();
        if failed {
            remove_partial(&path);
        }

        if let Some(e) = outcome.error {
            return Err(e);
        }
        finished?;
        if outcome.canceled {
            return Ok(RunEnd::Canceled { rows: outcome.rows });
        }

        let size_bytes = std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        Ok(RunEnd::Done {
            rows: outcome.rows,
            size_bytes,
        })
    }
}

fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed partial output {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial output {}: {}", path.display(), e),
    }
}
