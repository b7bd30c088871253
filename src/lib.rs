//! Export Queue Library
//!
//! Asynchronous CSV export pipeline: a bounded job queue, a fixed worker
//! pool, a streaming producer/consumer CSV encoder and a time-boxed archive of
//! finished jobs.
//!
//! # Modules
//!
//! - `cli`: Command-line interface and argument parsing
//! - `config`: Configuration management
//! - `error`: Error types and handling
//! - `export`: Job queue, workers, streaming pipeline and sources
//! - `formatter`: Output formatting for job listings
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use export_queue::{Config, ExportWrapper};
//! use export_queue::export::{JsonLinesSource, LogNotifier};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let wrapper = ExportWrapper::new(
//!         config.export,
//!         Arc::new(JsonLinesSource::new(config.source.data_dir)),
//!         Arc::new(LogNotifier),
//!     )?;
//!
//!     wrapper.init()?;
//!     println!("{} jobs queued", wrapper.queue_len());
//!
//!     wrapper.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod error;
pub mod export;
pub mod formatter;

// Re-export commonly used types
pub use config::Config;
pub use error::{ExportError, Result};
pub use export::{ExportWrapper, StreamedExport};
pub use formatter::Formatter;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library version string
pub fn version() -> &'static str {
    VERSION
}
