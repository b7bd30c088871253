//! Error handling module for the export pipeline.
//!
//! Errors here are the failures that end a single export job or reject a
//! request outright. Queue-full, duplicate-user and user cancellation are
//! not errors: they are reported as result codes on the job API.
//!
//! # Example
//!
//! ```rust,no_run
//! use export_queue::error::{ExportError, Result};
//!
//! fn check(separator: char, list_separator: char) -> Result<()> {
//!     if separator == list_separator {
//!         return Err(ExportError::Format("separators must differ".into()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod kinds;

// Re-export commonly used types
pub use kinds::{ConfigError, ExportError, OUTPUT_EXISTS_MESSAGE, Result, SourceError};
