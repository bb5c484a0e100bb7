//! Tabular reports and their file renderings.
//!
//! Used by reporting flows only; the collection loop never builds reports.

use std::fmt;

use rust_xlsxwriter::{Color, Format, Table as SheetTable, TableColumn, Workbook, XlsxError};
use serde::{Deserialize, Serialize};
use tracing::error;

/// Column names plus rows of already-formatted cells.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new<S: Into<String>>(columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row<S: Into<String>>(&mut self, row: impl IntoIterator<Item = S>) {
        self.rows.push(row.into_iter().map(Into::into).collect());
    }
}

/// File format of a report attachment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportFormat {
    #[default]
    DelimitedText,
    Spreadsheet,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ReportFormat::DelimitedText => "csv",
            ReportFormat::Spreadsheet => "xlsx",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ReportFormat::DelimitedText => "text/csv",
            ReportFormat::Spreadsheet => {
                "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            }
        }
    }
}

/// HTTP method used when uploading a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl fmt::Display for HttpVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HttpVerb::Get => "GET",
            HttpVerb::Post => "POST",
            HttpVerb::Put => "PUT",
            HttpVerb::Patch => "PATCH",
            HttpVerb::Delete => "DELETE",
        };
        f.write_str(s)
    }
}

/// Errors while rendering a report.
#[derive(Debug)]
pub enum ReportError {
    /// The table has no columns.
    NoColumns,
    /// The table does not fit worksheet row or column indices.
    TooLarge { rows: usize, columns: usize },
    Csv(csv::Error),
    Io(std::io::Error),
    Xlsx(XlsxError),
}

impl fmt::Display for ReportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReportError::NoColumns => write!(f, "table has no columns"),
            ReportError::TooLarge { rows, columns } => {
                write!(f, "table of {} rows and {} columns exceeds cell addressing", rows, columns)
            }
            ReportError::Csv(e) => write!(f, "CSV error: {}", e),
            ReportError::Io(e) => write!(f, "I/O error: {}", e),
            ReportError::Xlsx(e) => write!(f, "spreadsheet error: {}", e),
        }
    }
}

impl std::error::Error for ReportError {}

impl From<csv::Error> for ReportError {
    fn from(e: csv::Error) -> Self {
        ReportError::Csv(e)
    }
}

impl From<XlsxError> for ReportError {
    fn from(e: XlsxError) -> Self {
        ReportError::Xlsx(e)
    }
}

/// Renders the table as RFC 4180 CSV.
pub fn to_delimited(table: &Table, include_header: bool) -> Result<Vec<u8>, ReportError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());

    if include_header {
        writer.write_record(&table.columns)?;
    }
    for row in &table.rows {
        writer.write_record(row)?;
    }

    writer
        .into_inner()
        .map_err(|e| ReportError::Io(e.into_error()))
}

fn header_format() -> Format {
    Format::new()
        .set_bold()
        .set_font_color(Color::White)
        .set_background_color(Color::Orange)
}

/// Converts a zero-based position into worksheet coordinates.
fn cell(row: usize, col: usize) -> Result<(u32, u16), ReportError> {
    match (u32::try_from(row), u16::try_from(col)) {
        (Ok(r), Ok(c)) => Ok((r, c)),
        _ => Err(ReportError::TooLarge {
            rows: row,
            columns: col.saturating_add(1),
        }),
    }
}

fn try_build_spreadsheet(table: &Table, sheet_name: &str) -> Result<Vec<u8>, ReportError> {
    if table.columns.is_empty() {
        return Err(ReportError::NoColumns);
    }
    let width = table.columns.len();
    // A worksheet table needs at least one body row.
    let (last_row, last_col) = cell(table.rows.len().max(1), width - 1)?;

    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name(sheet_name)?;

    let header = header_format();
    for (col, name) in table.columns.iter().enumerate() {
        let (_, col) = cell(0, col)?;
        worksheet.write_string_with_format(0, col, name, &header)?;
    }

    for (row_idx, row) in table.rows.iter().enumerate() {
        for (col, value) in row.iter().take(width).enumerate() {
            let (r, c) = cell(row_idx + 1, col)?;
            worksheet.write_string(r, c, value)?;
        }
    }

    let columns: Vec<TableColumn> = table
        .columns
        .iter()
        .map(|name| {
            TableColumn::new()
                .set_header(name)
                .set_header_format(header.clone())
        })
        .collect();
    let sheet_table = SheetTable::new().set_columns(&columns);

    worksheet.add_table(0, 0, last_row, last_col, &sheet_table)?;
    worksheet.autofit();

    Ok(workbook.save_to_buffer()?)
}

/// Builds an XLSX workbook holding the table on one sheet.
///
/// Returns `None` when the workbook cannot be produced; the cause is logged.
pub fn build_spreadsheet(table: &Table, sheet_name: &str) -> Option<Vec<u8>> {
    match try_build_spreadsheet(table, sheet_name) {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            error!(location = "build_spreadsheet", sheet = sheet_name, error = %e, "Failed to build spreadsheet");
            None
        }
    }
}

/// Renders the table in the requested format, `None` on failure.
pub fn render(table: &Table, format: ReportFormat, sheet_name: &str) -> Option<Vec<u8>> {
    match format {
        ReportFormat::Spreadsheet => build_spreadsheet(table, sheet_name),
        ReportFormat::DelimitedText => match to_delimited(table, true) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(location = "render", error = %e, "Failed to build CSV");
                None
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Table {
        let mut t = Table::new(["timestamp", "value"]);
        t.push_row(["2024-01-01 00:00:00", "1.5"]);
        t.push_row(["2024-01-01 00:01:00", "say \"hi\", world"]);
        t
    }

    #[test]
    fn test_to_delimited_quotes_cells() {
        let out = String::from_utf8(to_delimited(&sample(), true).unwrap()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "timestamp,value");
        assert_eq!(lines[1], "2024-01-01 00:00:00,1.5");
        assert_eq!(lines[2], "2024-01-01 00:01:00,\"say \"\"hi\"\", world\"");
    }

    #[test]
    fn test_to_delimited_without_header() {
        let out = String::from_utf8(to_delimited(&sample(), false).unwrap()).unwrap();
        assert_eq!(out.lines().count(), 2);
        assert!(!out.starts_with("timestamp"));
    }

    #[test]
    fn test_build_spreadsheet_is_zip() {
        let bytes = build_spreadsheet(&sample(), "Readings").unwrap();
        assert!(bytes.starts_with(b"PK"));
    }

    #[test]
    fn test_build_spreadsheet_empty_rows() {
        let table = Table::new(["timestamp", "value"]);
        assert!(build_spreadsheet(&table, "Empty").is_some());
    }

    #[test]
    fn test_build_spreadsheet_failures_are_none() {
        assert!(build_spreadsheet(&Table::default(), "Sheet1").is_none());
        // Sheet names may not contain brackets.
        assert!(build_spreadsheet(&sample(), "bad[name]").is_none());
    }

    #[test]
    fn test_cell_rejects_out_of_range_positions() {
        assert_eq!(cell(1, 2).unwrap(), (1, 2));
        assert!(matches!(cell(0, 70_000), Err(ReportError::TooLarge { columns: 70_001, .. })));
        assert!(matches!(cell(usize::MAX, 0), Err(ReportError::TooLarge { .. })));
    }

    #[test]
    fn test_build_spreadsheet_too_wide_is_none() {
        let table = Table::new((0..70_000).map(|i| format!("c{}", i)));
        assert!(build_spreadsheet(&table, "Wide").is_none());
    }

    #[test]
    fn test_render_formats() {
        assert!(render(&sample(), ReportFormat::DelimitedText, "x").unwrap().starts_with(b"timestamp"));
        assert!(render(&sample(), ReportFormat::Spreadsheet, "x").unwrap().starts_with(b"PK"));
        assert_eq!(ReportFormat::Spreadsheet.extension(), "xlsx");
        assert_eq!(HttpVerb::Put.to_string(), "PUT");
    }
}
