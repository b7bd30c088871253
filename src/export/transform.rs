//! Row transform: hits to CSV bytes
//!
//! A pure, synchronous conversion of a batch of hits into CSV rows. The
//! caller owns the stream state and tells the transform whether the batch is
//! the first of the stream, which is the only batch that carries a header.

use std::collections::BTreeSet;
use std::fmt::Write as _;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ExportError, Result};

/// One exported record
pub type Hit = Map<String, Value>;

/// Naive date/time layouts recognized in string cells, tried in order
const NAIVE_DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M",
];

/// Output column configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnFormat {
    /// Field name, dotted for nested lookup (`a.b`)
    pub name: String,

    /// Header label; the field name is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// chrono strftime pattern applied to date/time values
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

/// CSV formatting options of an export job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsvParams {
    /// Column separator
    pub separator: char,

    /// Separator used to join list-valued cells
    pub list_separator: char,

    /// Maximum number of rows for the whole job, 0 for no limit
    pub limit: usize,

    /// Write plain `.csv` instead of `.csv.gz`
    pub uncompressed_output: bool,

    /// Columns to export; inferred from the first batch when empty
    #[serde(default)]
    pub columns: Vec<ColumnFormat>,
}

impl Default for CsvParams {
    fn default() -> Self {
        Self {
            separator: ',',
            list_separator: '|',
            limit: 0,
            uncompressed_output: false,
            columns: Vec::new(),
        }
    }
}

impl ColumnFormat {
    /// Column exporting a field under its own name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: None,
            format: None,
        }
    }

    /// Set the header label
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Set the date/time format
    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Parse the `name[:label[:format]]` shorthand used on the command line
    ///
    /// The format part may itself contain colons (`%H:%M`).
    pub fn parse_spec(spec: &str) -> Self {
        let mut parts = spec.splitn(3, ':');
        let name = parts.next().unwrap_or_default().to_string();
        let label = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        let format = parts.next().filter(|s| !s.is_empty()).map(str::to_string);
        Self {
            name,
            label,
            format,
        }
    }

    fn header(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.name)
    }
}

impl CsvParams {
    /// Check the separators can produce unambiguous output
    pub fn validate(&self) -> Result<()> {
        if self.separator == self.list_separator {
            return Err(ExportError::Format(format!(
                "separator and list separator must differ (both '{}')",
                self.separator
            )));
        }
        if matches!(self.separator, '"' | '\n' | '\r') {
            return Err(ExportError::Format(format!(
                "invalid separator {:?}",
                self.separator
            )));
        }
        Ok(())
    }
}

/// Convert a batch of hits into CSV bytes
///
/// # Arguments
/// * `hits` - Records to convert
/// * `columns` - Columns to emit, in order
/// * `params` - Separators
/// * `first_batch` - Emit the header row before the data rows
///
/// # Returns
/// * `Result<Vec<u8>>` - Encoded rows, each terminated by `\n`
pub fn hits_to_csv(
    hits: &[Hit],
    columns: &[ColumnFormat],
    params: &CsvParams,
    first_batch: bool,
) -> Result<Vec<u8>> {
    params.validate()?;

    let separator = params.separator.to_string();
    let mut out = String::new();

    if first_batch {
        let header: Vec<String> = columns
            .iter()
            .map(|c| escape_cell(c.header(), params.separator))
            .collect();
        out.push_str(&header.join(&separator));
        out.push('\n');
    }

    for hit in hits {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| {
                let value = lookup_path(hit, &column.name)
                    .map(|v| render_value(v, column, params.list_separator))
                    .unwrap_or_default();
                escape_cell(&value, params.separator)
            })
            .collect();
        out.push_str(&cells.join(&separator));
        out.push('\n');
    }

    Ok(out.into_bytes())
}

/// Collect the sorted union of top-level field names in a batch
pub fn infer_columns(hits: &[Hit]) -> Vec<ColumnFormat> {
    let names: BTreeSet<&String> = hits.iter().flat_map(|hit| hit.keys()).collect();
    names.into_iter().map(ColumnFormat::new).collect()
}

/// Look up a possibly dotted field name
///
/// A literal key containing dots wins over nested traversal.
pub fn lookup_path<'a>(hit: &'a Hit, path: &str) -> Option<&'a Value> {
    if let Some(value) = hit.get(path) {
        return Some(value);
    }
    let mut parts = path.split('.');
    let mut current = hit.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn render_value(value: &Value, column: &ColumnFormat, list_separator: char) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => match &column.format {
            Some(format) => reformat_datetime(s, format).unwrap_or_else(|| s.clone()),
            None => s.clone(),
        },
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, column, list_separator))
            .collect::<Vec<_>>()
            .join(&list_separator.to_string()),
        Value::Object(_) => value.to_string(),
    }
}

/// Re-format a recognized date/time string, `None` if unrecognized or the
/// pattern cannot render it
fn reformat_datetime(raw: &str, format: &str) -> Option<String> {
    let mut out = String::new();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        write!(out, "{}", dt.format(format)).ok()?;
        return Some(out);
    }
    let naive = NAIVE_DATETIME_FORMATS
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(raw, layout).ok())
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })?;
    // Patterns with an offset (%z) fail on naive values instead of panicking
    write!(out, "{}", naive.format(format)).ok()?;
    Some(out)
}

/// Quote a cell if it contains the separator, a quote, or a line break
fn escape_cell(value: &str, separator: char) -> String {
    if value.contains(separator) || value.contains('"') || value.contains('\n') || value.contains('\r')
    {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
