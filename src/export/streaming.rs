//! Streamed export pipeline
//!
//! A producer task walks the export's source targets one after another and
//! sends hit batches over a small bounded channel. A single consumer drains
//! the channel, runs the row transform and writes each chunk to the sink,
//! flushing after every chunk. Both sides share a cancellation token and are
//! joined before the outcome is reported.

use std::io::Write;
use std::sync::Arc;
use std::time::Instant;

use indicatif::ProgressBar;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{ExportError, Result};

use super::job::{ExportPayload, ExtraParams};
use super::source::{HitSource, HitStream, SourceTarget};
use super::transform::{ColumnFormat, CsvParams, Hit, hits_to_csv, infer_columns};

const DEFAULT_BATCH_SIZE: usize = 500;
const DEFAULT_CHANNEL_CAPACITY: usize = 4;

/// How the producer stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProducerEnd {
    /// Every target was drained
    Completed,
    /// The job row limit was reached
    LimitReached,
    /// Cancellation observed
    Canceled,
    /// The consumer hung up
    ConsumerGone,
}

/// What the consumer hands back after the channel closes
struct ConsumerEnd<W> {
    sink: W,
    rows: u64,
    error: Option<ExportError>,
    canceled: bool,
}

/// Result of one pipeline run
#[derive(Debug)]
pub struct StreamOutcome<W> {
    /// The sink, unless the consumer task died
    pub sink: Option<W>,
    /// Rows written to the sink
    pub rows: u64,
    /// First failure on either side
    pub error: Option<ExportError>,
    /// Cancellation was observed before the stream completed
    pub canceled: bool,
    /// Wall time of the run
    pub elapsed_ms: u64,
}

/// Summary of a finished direct export
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub rows: u64,
    pub elapsed_ms: u64,
    pub canceled: bool,
}

impl<W> StreamOutcome<W> {
    /// Collapse into the sink and a summary, surfacing the error if any
    pub fn into_result(self) -> Result<(Option<W>, ExportSummary)> {
        if let Some(e) = self.error {
            return Err(e);
        }
        Ok((
            self.sink,
            ExportSummary {
                rows: self.rows,
                elapsed_ms: self.elapsed_ms,
                canceled: self.canceled,
            },
        ))
    }
}

/// One producer/consumer export run
pub struct StreamedExport {
    source: Arc<dyn HitSource>,
    targets: Vec<SourceTarget>,
    params: CsvParams,
    extra: ExtraParams,
    batch_size: usize,
    channel_capacity: usize,
    cancel: CancellationToken,
    progress: Option<ProgressBar>,
}

impl StreamedExport {
    /// Create an export of `payload` with the given CSV parameters
    pub fn new(source: Arc<dyn HitSource>, payload: &ExportPayload, params: CsvParams) -> Self {
        Self {
            source,
            targets: payload.targets(),
            params,
            extra: ExtraParams::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Set extra source filters
    pub fn with_extra(mut self, extra: ExtraParams) -> Self {
        self.extra = extra;
        self
    }

    /// Set the number of hits requested per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Set the number of batches buffered between the two sides
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Set cancellation token for this export
    ///
    /// The pipeline works on a child of this token, so internal failures
    /// never cancel the caller's token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Advance `bar` to the running row count after every written chunk
    ///
    /// The bar is cleared when the consumer stops.
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    /// Run the pipeline into `sink`
    ///
    /// Never fails by itself: failures and cancellation are reported in the
    /// outcome, together with the sink so the caller can finalize it.
    pub async fn run<W>(self, sink: W) -> StreamOutcome<W>
    where
        W: Write + Send + 'static,
    {
        let start_time = Instant::now();

        if let Err(e) = self.params.validate() {
            return StreamOutcome {
                sink: Some(sink),
                rows: 0,
                error: Some(e),
                canceled: false,
                elapsed_ms: 0,
            };
        }

        let token = self.cancel.child_token();
        let (tx, rx) = mpsc::channel::<Vec<Hit>>(self.channel_capacity);

        info!("Starting export of {} source(s)", self.targets.len());

        let producer = {
            let token = token.clone();
            let source = self.source;
            let targets = self.targets;
            let extra = self.extra;
            let batch_size = self.batch_size;
            let limit = self.params.limit as u64;
            tokio::spawn(async move {
                let result = produce(source, targets, extra, batch_size, limit, tx, &token).await;
                if result.is_err() {
                    token.cancel();
                }
                result
            })
        };

        let consumer = {
            let token = token.clone();
            let params = self.params;
            let progress = self.progress;
            tokio::task::spawn_blocking(move || consume(rx, sink, params, token, progress))
        };

        let (produced, consumed) = tokio::join!(producer, consumer);

        let mut error = None;
        let mut canceled = false;
        match produced {
            Ok(Ok(end)) => {
                debug!("Producer finished: {:?}", end);
                canceled |= end == ProducerEnd::Canceled;
            }
            Ok(Err(e)) => error = Some(e),
            Err(e) => error = Some(ExportError::Generic(format!("producer task failed: {e}"))),
        }

        let (sink, rows) = match consumed {
            Ok(end) => {
                canceled |= end.canceled;
                if end.error.is_some() {
                    error = end.error;
                }
                (Some(end.sink), end.rows)
            }
            Err(e) => {
                error.get_or_insert(ExportError::Generic(format!("consumer task failed: {e}")));
                (None, 0)
            }
        };

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        match (&error, canceled) {
            (Some(e), _) => warn!("Export failed after {} rows: {}", rows, e),
            (None, true) => info!("Export canceled after {} rows", rows),
            (None, false) => info!("Export completed: {} rows, {} ms", rows, elapsed_ms),
        }

        StreamOutcome {
            sink,
            rows,
            error,
            canceled,
            elapsed_ms,
        }
    }
}

/// Stream an export straight into an open sink, bypassing the queue
///
/// # Arguments
/// * `source` - Hit source to read from
/// * `payload` - Facts or custom query to export
/// * `params` - CSV parameters
/// * `extra` - Extra source filters
/// * `sink` - Destination, e.g. a response body or stdout
/// * `cancel` - Caller's cancellation token
pub async fn stream_to_writer<W>(
    source: Arc<dyn HitSource>,
    payload: &ExportPayload,
    params: CsvParams,
    extra: ExtraParams,
    sink: W,
    cancel: CancellationToken,
) -> Result<ExportSummary>
where
    W: Write + Send + 'static,
{
    let (_, summary) = StreamedExport::new(source, payload, params)
        .with_extra(extra)
        .with_cancellation(cancel)
        .run(sink)
        .await
        .into_result()?;
    Ok(summary)
}

async fn produce(
    source: Arc<dyn HitSource>,
    targets: Vec<SourceTarget>,
    extra: ExtraParams,
    batch_size: usize,
    limit: u64,
    tx: mpsc::Sender<Vec<Hit>>,
    token: &CancellationToken,
) -> Result<ProducerEnd> {
    let mut sent = 0u64;

    for target in &targets {
        if token.is_cancelled() {
            return Ok(ProducerEnd::Canceled);
        }

        debug!("Opening {}", target.describe());
        let mut stream = source.open(target, &extra).await?;
        let pumped = pump(stream.as_mut(), batch_size, limit, &mut sent, &tx, token).await;
        let closed = stream.close().await;

        if let Some(end) = pumped? {
            return Ok(end);
        }
        closed?;
    }

    Ok(ProducerEnd::Completed)
}

/// Forward one stream's batches; `None` when the stream is exhausted
async fn pump(
    stream: &mut dyn HitStream,
    batch_size: usize,
    limit: u64,
    sent: &mut u64,
    tx: &mpsc::Sender<Vec<Hit>>,
    token: &CancellationToken,
) -> Result<Option<ProducerEnd>> {
    loop {
        let batch = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Some(ProducerEnd::Canceled)),
            batch = stream.next_batch(batch_size) => batch?,
        };

        let Some(mut hits) = batch else {
            return Ok(None);
        };
        if limit > 0 {
            let remaining = (limit - *sent) as usize;
            hits.truncate(remaining);
        }
        if hits.is_empty() {
            continue;
        }

        *sent += hits.len() as u64;
        tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(Some(ProducerEnd::Canceled)),
            delivered = tx.send(hits) => {
                if delivered.is_err() {
                    return Ok(Some(ProducerEnd::ConsumerGone));
                }
            }
        }

        if limit > 0 && *sent >= limit {
            return Ok(Some(ProducerEnd::LimitReached));
        }
    }
}

fn consume<W: Write>(
    mut rx: mpsc::Receiver<Vec<Hit>>,
    mut sink: W,
    params: CsvParams,
    token: CancellationToken,
    progress: Option<ProgressBar>,
) -> ConsumerEnd<W> {
    let mut columns = params.columns.clone();
    let mut first = true;
    let mut rows = 0u64;
    let mut error = None;
    let mut canceled = false;

    while let Some(hits) = rx.blocking_recv() {
        if token.is_cancelled() {
            canceled = true;
            break;
        }
        if first && columns.is_empty() {
            columns = infer_columns(&hits);
        }
        if let Err(e) = write_chunk(&mut sink, &hits, &columns, &params, first) {
            token.cancel();
            error = Some(e);
            break;
        }
        first = false;
        rows += hits.len() as u64;
        if let Some(ref bar) = progress {
            bar.set_position(rows);
        }
    }

    // Dropping the receiver wakes a producer blocked on send
    drop(rx);

    if first && error.is_none() && !canceled && !token.is_cancelled() && !columns.is_empty() {
        if let Err(e) = write_chunk(&mut sink, &[], &columns, &params, true) {
            error = Some(e);
        }
    }

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }

    ConsumerEnd {
        sink,
        rows,
        error,
        canceled,
    }
}

fn write_chunk<W: Write>(
    sink: &mut W,
    hits: &[Hit],
    columns: &[ColumnFormat],
    params: &CsvParams,
    first: bool,
) -> Result<()> {
    let bytes = hits_to_csv(hits, columns, params, first)?;
    sink.write_all(&bytes).map_err(ExportError::Sink)?;
    sink.flush().map_err(ExportError::Sink)
}
