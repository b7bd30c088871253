//! Output formatting for export jobs
//!
//! This module renders job listings and run summaries for the terminal:
//! - Table formatting for job lists
//! - JSON formatting (plain and pretty-printed)

use std::fmt;
use std::str::FromStr;

use crate::error::{ExportError, Result};
use crate::export::{ExportItem, ExportSummary, SweepStats};

mod table;

pub use table::{JobTable, TableStyle, human_size};

/// Output format for job listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
    JsonPretty,
}

impl FromStr for OutputFormat {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "table" => Ok(OutputFormat::Table),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "pretty" => Ok(OutputFormat::JsonPretty),
            other => Err(ExportError::Generic(format!(
                "Unknown output format: {other}. Supported formats: table, json, json-pretty"
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::JsonPretty => write!(f, "json-pretty"),
        }
    }
}

/// Main formatter for command output
pub struct Formatter {
    format: OutputFormat,
    use_colors: bool,
}

impl Formatter {
    /// Create a new formatter
    ///
    /// # Arguments
    /// * `format` - Output format
    /// * `use_colors` - Enable colored table headers
    pub fn new(format: OutputFormat, use_colors: bool) -> Self {
        Self { format, use_colors }
    }

    /// Format a list of jobs
    ///
    /// # Arguments
    /// * `items` - Jobs to render
    ///
    /// # Returns
    /// * `Result<String>` - Rendered output or error
    pub fn format_jobs(&self, items: &[ExportItem]) -> Result<String> {
        match self.format {
            OutputFormat::Table => Ok(JobTable::with_colors(self.use_colors).format(items)),
            OutputFormat::Json => serde_json::to_string(items)
                .map_err(|e| ExportError::Generic(format!("JSON serialization failed: {e}"))),
            OutputFormat::JsonPretty => serde_json::to_string_pretty(items)
                .map_err(|e| ExportError::Generic(format!("JSON serialization failed: {e}"))),
        }
    }

    /// One-line summary of a direct stream
    pub fn format_summary(&self, summary: &ExportSummary) -> String {
        let state = if summary.canceled { "canceled" } else { "done" };
        format!(
            "Export {}: {} rows in {} ms",
            state, summary.rows, summary.elapsed_ms
        )
    }

    pub fn format_sweep(&self, stats: &SweepStats) -> String {
        format!(
            "Removed {} expired file(s) and {} archive entr{}",
            stats.files_removed,
            stats.entries_removed,
            if stats.entries_removed == 1 { "y" } else { "ies" }
        )
    }
}

impl Default for Formatter {
    fn default() -> Self {
        Self::new(OutputFormat::Table, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::{CsvParams, ExportPayload, ExtraParams, FactRef};

    fn item() -> ExportItem {
        ExportItem::new(
            ExportPayload::Facts(vec![FactRef::new(1, "orders")]),
            "orders.csv".into(),
            CsvParams::default(),
            "alice",
            ExtraParams::new(),
            false,
        )
    }

    #[test]
    fn test_parse_output_format() {
        assert_eq!("table".parse::<OutputFormat>().unwrap(), OutputFormat::Table);
        assert_eq!("JSON".parse::<OutputFormat>().unwrap(), OutputFormat::Json);
        assert_eq!(
            "json-pretty".parse::<OutputFormat>().unwrap(),
            OutputFormat::JsonPretty
        );
        assert!("xml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_format_jobs_json() {
        let formatter = Formatter::new(OutputFormat::Json, false);
        let output = formatter.format_jobs(&[item()]).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed[0]["file_name"], "orders.csv");
        assert_eq!(parsed[0]["status"], "pending");
    }

    #[test]
    fn test_format_summary() {
        let formatter = Formatter::default();
        let summary = ExportSummary {
            rows: 3,
            elapsed_ms: 12,
            canceled: false,
        };
        assert_eq!(formatter.format_summary(&summary), "Export done: 3 rows in 12 ms");
        let stats = SweepStats {
            files_removed: 2,
            entries_removed: 1,
        };
        assert_eq!(
            formatter.format_sweep(&stats),
            "Removed 2 expired file(s) and 1 archive entry"
        );
    }
}
