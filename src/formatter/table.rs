//! Table formatting for export job listings using tabled

use tabled::{
    Table,
    builder::Builder,
    settings::{Alignment, Color, Modify, Style, object::Columns, object::Rows, width::Width},
};

use crate::export::ExportItem;

/// Maximum width for a single column (characters)
const DEFAULT_MAX_COLUMN_WIDTH: usize = 40;

const HEADERS: [&str; 8] = ["id", "file", "status", "users", "rows", "size", "created", "error"];

/// Table formatter for job lists
pub struct JobTable {
    max_column_width: usize,
    style: TableStyle,
    use_colors: bool,
}

/// Available table styles
#[derive(Debug, Clone, Copy)]
pub enum TableStyle {
    Modern,
    Ascii,
    Rounded,
    Markdown,
    Psql,
}

impl JobTable {
    pub fn new() -> Self {
        Self {
            max_column_width: DEFAULT_MAX_COLUMN_WIDTH,
            style: TableStyle::Modern,
            use_colors: false,
        }
    }

    /// Create a table formatter with colored headers
    pub fn with_colors(use_colors: bool) -> Self {
        Self {
            use_colors,
            ..Self::new()
        }
    }

    pub fn with_style(mut self, style: TableStyle) -> Self {
        self.style = style;
        self
    }

    pub fn with_max_column_width(mut self, width: usize) -> Self {
        self.max_column_width = width;
        self
    }

    /// Render jobs as a table, one row per job
    pub fn format(&self, items: &[ExportItem]) -> String {
        if items.is_empty() {
            return "(no exports)".to_string();
        }

        let mut builder = Builder::default();
        builder.push_record(HEADERS.map(String::from));
        for item in items {
            builder.push_record(Self::row(item));
        }

        let mut table = builder.build();
        self.apply_style(&mut table);

        // Wrap long values instead of truncating them
        for i in 0..HEADERS.len() {
            table.with(Modify::new(Columns::new(i..=i)).with(Width::wrap(self.max_column_width)));
        }
        table.with(Modify::new(Rows::first()).with(Alignment::center()));

        if self.use_colors {
            table.modify(Rows::first(), Color::FG_CYAN | Color::BOLD);
        }

        table.to_string()
    }

    fn row(item: &ExportItem) -> Vec<String> {
        vec![
            item.id.clone(),
            item.file_name.clone(),
            item.status.to_string(),
            item.users.join(", "),
            item.rows.to_string(),
            human_size(item.size_bytes),
            item.date.format("%Y-%m-%d %H:%M:%S").to_string(),
            item.error.clone(),
        ]
    }

    fn apply_style(&self, table: &mut Table) {
        match self.style {
            TableStyle::Modern => table.with(Style::modern()),
            TableStyle::Ascii => table.with(Style::ascii()),
            TableStyle::Rounded => table.with(Style::rounded()),
            TableStyle::Markdown => table.with(Style::markdown()),
            TableStyle::Psql => table.with(Style::psql()),
        };
    }
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Format a byte count with a binary unit
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}
