//! Export job pipeline
//!
//! This module provides a queued export system:
//! - A bounded queue of jobs, shared by every user who requested the same export
//! - A fixed pool of workers, each running one job at a time
//! - A streaming producer/consumer pipeline turning hits into CSV
//! - An archive of finished jobs, pruned after a retention period
//!
//! # Architecture
//!
//! 1. **HitSource**: Backend yielding batches of hits for a fact or raw query
//! 2. **StreamedExport**: Producer task pulling batches, blocking consumer writing CSV
//! 3. **ExportWorker**: Runs one job into a (possibly gzip) file and reports back
//! 4. **ExportWrapper**: Owns queue, worker slots and archive; dispatches jobs
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use export_queue::config::ExportConfig;
//! use export_queue::export::{
//!     CsvParams, ExportWrapper, ExtraParams, FactRef, JsonLinesSource, LogNotifier,
//! };
//!
//! # async fn run() -> export_queue::error::Result<()> {
//! let wrapper = ExportWrapper::new(
//!     ExportConfig::new("./exports", 10, 2, 7),
//!     Arc::new(JsonLinesSource::new("./data")),
//!     Arc::new(LogNotifier),
//! )?;
//! wrapper.init()?;
//! wrapper.add_to_queue(
//!     vec![FactRef::new(1, "orders")],
//!     "orders",
//!     CsvParams::default(),
//!     "alice",
//!     ExtraParams::new(),
//!     true,
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod job;
pub mod notifier;
pub mod source;
pub mod streaming;
pub mod transform;
pub mod worker;
pub mod wrapper;
pub mod writers;

pub use job::{
    AddCode, CustomQuery, DeleteCode, ExportItem, ExportPayload, ExportStatus, ExtraParams,
    FactRef, normalize_file_name,
};
pub use notifier::{ChannelNotifier, ExportNotification, LogNotifier, Notifier};
pub use source::{HitSource, HitStream, JsonLinesSource, MemorySource, SourceTarget};
pub use streaming::{ExportSummary, StreamOutcome, StreamedExport, stream_to_writer};
pub use transform::{ColumnFormat, CsvParams, Hit, hits_to_csv, infer_columns};
pub use worker::{ExportWorker, WorkerReport};
pub use wrapper::{ExportWrapper, SweepStats};
pub use writers::OutputWriter;
