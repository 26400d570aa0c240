//! Spreadsheet ingestion (CSV and Excel workbooks) and export of finalized snapshots.

use std::collections::BTreeMap;
use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Data, Reader};
use recon_core::{format_us_date, serial_day_to_date, CellValue, Snapshot};
use rust_xlsxwriter::{Format, Workbook};
use thiserror::Error;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "recon-ingest";

pub const EXPORT_SHEET_NAME: &str = "Processed";

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const OLE_MAGIC: &[u8] = &[0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];
const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("{name} is {size} bytes, over the {limit} byte upload limit")]
    TooLarge {
        name: String,
        size: usize,
        limit: usize,
    },
    #[error("unsupported file type: {0}")]
    UnsupportedType(String),
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("workbook error: {0}")]
    Workbook(String),
    #[error("export error: {0}")]
    Export(String),
    #[error("{0} has no header row")]
    EmptyInput(String),
}

impl From<calamine::Error> for IngestError {
    fn from(err: calamine::Error) -> Self {
        Self::Workbook(err.to_string())
    }
}

impl From<rust_xlsxwriter::XlsxError> for IngestError {
    fn from(err: rust_xlsxwriter::XlsxError) -> Self {
        Self::Export(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpreadsheetKind {
    Csv,
    Workbook,
}

impl SpreadsheetKind {
    /// Extension first; magic bytes when the name is missing or says nothing useful.
    pub fn detect(file_name: Option<&str>, bytes: &[u8]) -> Result<Self, IngestError> {
        if let Some(name) = file_name {
            let lower = name.to_ascii_lowercase();
            if lower.ends_with(".csv") || lower.ends_with(".txt") {
                return Ok(Self::Csv);
            }
            if lower.ends_with(".xlsx") || lower.ends_with(".xls") {
                return Ok(Self::Workbook);
            }
        }

        if bytes.starts_with(ZIP_MAGIC) || bytes.starts_with(OLE_MAGIC) {
            return Ok(Self::Workbook);
        }

        match file_name {
            None => Ok(Self::Csv),
            Some(name) => Err(IngestError::UnsupportedType(name.to_string())),
        }
    }
}

/// Header row plus string cells, one inner vec per data row, padded to the header width.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawTable {
    pub sheet: Option<String>,
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl RawTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn cell(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    fn from_grid(sheet: Option<String>, mut grid: Vec<Vec<String>>) -> Option<Self> {
        if grid.is_empty() {
            return None;
        }
        let headers: Vec<String> = grid.remove(0).iter().map(|h| clean_header(h)).collect();
        let width = headers.len();
        let rows = grid
            .into_iter()
            .filter(|row| row.iter().any(|cell| !cell.trim().is_empty()))
            .map(|mut row| {
                row.resize(width, String::new());
                row
            })
            .collect();
        Some(Self {
            sheet,
            headers,
            rows,
        })
    }
}

/// Trims a header and turns non-breaking spaces into plain spaces.
pub fn clean_header(raw: &str) -> String {
    raw.replace('\u{a0}', " ").trim().to_string()
}

/// Renames headers through the alias table; unknown headers pass through.
pub fn normalize_column_names(mut table: RawTable, aliases: &BTreeMap<String, String>) -> RawTable {
    for header in &mut table.headers {
        if let Some(canonical) = aliases.get(header.as_str()) {
            debug!(from = %header, to = %canonical, "renaming column");
            *header = canonical.clone();
        }
    }
    table
}

pub fn read_csv(bytes: &[u8]) -> Result<RawTable, IngestError> {
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut grid = Vec::new();
    for record in reader.byte_records() {
        let record = record?;
        grid.push(
            record
                .iter()
                .map(|field| String::from_utf8_lossy(field).into_owned())
                .collect::<Vec<_>>(),
        );
    }

    RawTable::from_grid(None, grid).ok_or_else(|| IngestError::EmptyInput("csv".to_string()))
}

/// Every sheet in the workbook that has at least a header row, in workbook order.
pub fn read_workbook_sheets(bytes: &[u8]) -> Result<Vec<RawTable>, IngestError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))?;
    let names: Vec<String> = workbook.sheet_names().to_vec();

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let range = workbook.worksheet_range(&name)?;
        let grid: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(cell_to_text).collect())
            .collect();
        if let Some(table) = RawTable::from_grid(Some(name), grid) {
            tables.push(table);
        }
    }
    Ok(tables)
}

pub fn read_workbook(bytes: &[u8]) -> Result<RawTable, IngestError> {
    read_workbook_sheets(bytes)?
        .into_iter()
        .next()
        .ok_or_else(|| IngestError::EmptyInput("workbook".to_string()))
}

/// Size-checks and parses one upload.
pub fn load_table(
    file_name: Option<&str>,
    bytes: &[u8],
    max_bytes: usize,
) -> Result<RawTable, IngestError> {
    let name = file_name.unwrap_or("upload");
    if bytes.len() > max_bytes {
        return Err(IngestError::TooLarge {
            name: name.to_string(),
            size: bytes.len(),
            limit: max_bytes,
        });
    }

    let kind = SpreadsheetKind::detect(file_name, bytes)?;
    let table = match kind {
        SpreadsheetKind::Csv => read_csv(bytes)?,
        SpreadsheetKind::Workbook => read_workbook(bytes)?,
    };
    info!(
        file = name,
        ?kind,
        rows = table.len(),
        columns = table.headers.len(),
        "loaded spreadsheet"
    );
    Ok(table)
}

/// First sheet whose headers contain every `required` column, compared
/// case-insensitively with non-breaking spaces ignored. Matching headers are renamed
/// to the canonical spelling in `required`.
pub fn find_sheet_with_columns(
    bytes: &[u8],
    required: &[&str],
) -> Result<Option<RawTable>, IngestError> {
    let fold = |s: &str| clean_header(s).to_lowercase();

    for mut table in read_workbook_sheets(bytes)? {
        let folded: Vec<String> = table.headers.iter().map(|h| fold(h)).collect();
        let positions: Option<Vec<usize>> = required
            .iter()
            .map(|want| folded.iter().position(|h| *h == fold(want)))
            .collect();

        if let Some(positions) = positions {
            for (idx, canonical) in positions.into_iter().zip(required) {
                table.headers[idx] = canonical.to_string();
            }
            debug!(sheet = ?table.sheet, "sheet matches required columns");
            return Ok(Some(table));
        }
    }
    Ok(None)
}

fn cell_to_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        Data::String(s) => s.clone(),
        Data::Float(f) => format_float(*f),
        Data::Int(i) => i.to_string(),
        Data::Bool(b) => if *b { "TRUE" } else { "FALSE" }.to_string(),
        Data::Error(_) => String::new(),
        Data::DateTime(dt) => excel_datetime_text(dt.as_f64()),
        Data::DateTimeIso(s) => s.clone(),
        Data::DurationIso(s) => s.clone(),
    }
}

fn format_float(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{value:.0}")
    } else {
        value.to_string()
    }
}

/// Whole-day serials render `MM/DD/YYYY`; serials with a time part render
/// `YYYY-MM-DD HH:MM:SS`.
fn excel_datetime_text(serial: f64) -> String {
    let Some(date) = serial_day_to_date(serial.trunc() as i64) else {
        return format_float(serial);
    };
    let seconds = ((serial.fract() * 86_400.0).round() as u32).min(86_399);
    if seconds == 0 {
        return format_us_date(date);
    }
    format!(
        "{} {:02}:{:02}:{:02}",
        date.format("%Y-%m-%d"),
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

pub fn write_csv(snapshot: &Snapshot) -> Result<Vec<u8>, IngestError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(snapshot.columns())?;
    for row in snapshot.to_rows() {
        writer.write_record(&row)?;
    }
    writer
        .into_inner()
        .map_err(|e| IngestError::Export(e.to_string()))
}

/// Single-sheet workbook with a bold header row. Numeric cells stay numeric.
pub fn write_xlsx(snapshot: &Snapshot) -> Result<Vec<u8>, IngestError> {
    let mut workbook = Workbook::new();
    let header_format = Format::new().set_bold();
    let sheet = workbook.add_worksheet();
    sheet.set_name(EXPORT_SHEET_NAME)?;

    for (col, name) in snapshot.columns().iter().enumerate() {
        sheet.write_string_with_format(0, col as u16, name, &header_format)?;
    }

    for (row_idx, record) in snapshot.records().iter().enumerate() {
        let row = (row_idx + 1) as u32;
        for (col, name) in snapshot.columns().iter().enumerate() {
            let col = col as u16;
            match record.value(name) {
                CellValue::Blank => {}
                CellValue::Number(n) => {
                    sheet.write_number(row, col, *n)?;
                }
                other => {
                    sheet.write_string(row, col, other.render())?;
                }
            }
        }
    }

    Ok(workbook.save_to_buffer()?)
}
