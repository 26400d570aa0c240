//! Raw table → deduplicated snapshot, with row metrics and invalid-date samples.

use std::collections::{BTreeMap, HashSet};

use recon_core::{
    normalize_flag, normalize_identifier, parse_sheet_date, CellValue, ColumnProfile, DateCell,
    ParseWarning, Record, SchemaError, Snapshot,
};
use recon_ingest::RawTable;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub const DEFAULT_MAX_SAMPLES: usize = 20;

/// Which columns are required and which get flag / date normalization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizeSpec {
    pub id_column: String,
    pub required: Vec<String>,
    pub flag_columns: Vec<String>,
    pub date_columns: Vec<String>,
    pub max_samples: usize,
}

impl NormalizeSpec {
    /// Lead exports: only the identifier is required. The overlay flag and dates get
    /// the same rules as the survey when present; everything else passes through.
    pub fn leads(profile: &ColumnProfile) -> Self {
        let overlay = &profile.overlay;
        Self {
            id_column: profile.identifier_column.clone(),
            required: vec![profile.identifier_column.clone()],
            flag_columns: vec![overlay.flag.clone()],
            date_columns: vec![overlay.date_a.clone(), overlay.date_b.clone()],
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    /// Geospatial survey files: identifier plus the three overlay columns.
    pub fn survey(profile: &ColumnProfile) -> Self {
        let overlay = &profile.overlay;
        Self {
            id_column: profile.identifier_column.clone(),
            required: vec![
                profile.identifier_column.clone(),
                overlay.flag.clone(),
                overlay.date_a.clone(),
                overlay.date_b.clone(),
            ],
            flag_columns: vec![overlay.flag.clone()],
            date_columns: vec![overlay.date_a.clone(), overlay.date_b.clone()],
            max_samples: DEFAULT_MAX_SAMPLES,
        }
    }

    pub fn required_refs(&self) -> Vec<&str> {
        self.required.iter().map(String::as_str).collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeMetrics {
    pub total_rows_input: usize,
    pub rows_after_id_filter: usize,
    pub discarded_empty_id: usize,
    pub duplicates_dropped: usize,
    pub invalid_dates: BTreeMap<String, usize>,
}

pub type InvalidSamples = BTreeMap<String, Vec<ParseWarning>>;

#[derive(Debug, Clone)]
pub struct Normalized {
    pub snapshot: Snapshot,
    pub metrics: NormalizeMetrics,
    pub invalid_samples: InvalidSamples,
}

pub fn check_required_columns(headers: &[String], required: &[String]) -> Result<(), SchemaError> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !headers.iter().any(|h| h == *name))
        .cloned()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SchemaError { missing })
    }
}

/// Normalizes every row of `table` into a record keyed by its identifier.
///
/// Pass-through cells become trimmed text. Flag columns become `Yes`/`No`/blank.
/// Date columns become dates, or blank with a `ParseWarning` when unparseable.
/// Rows without an identifier are dropped and counted; duplicate identifiers keep
/// the last row, at the position of that last row.
pub fn normalize(table: &RawTable, spec: &NormalizeSpec) -> Result<Normalized, SchemaError> {
    check_required_columns(&table.headers, &spec.required)?;

    let id_idx = table
        .column_index(&spec.id_column)
        .ok_or_else(|| SchemaError {
            missing: vec![spec.id_column.clone()],
        })?;

    let mut metrics = NormalizeMetrics {
        total_rows_input: table.len(),
        ..Default::default()
    };
    let mut invalid_samples = InvalidSamples::new();
    let mut records = Vec::with_capacity(table.len());

    for row in 0..table.len() {
        let identifier = normalize_identifier(table.cell(row, id_idx));
        if identifier.is_empty() {
            metrics.discarded_empty_id += 1;
            continue;
        }

        let mut record = Record::new(identifier.clone());
        for (col, name) in table.headers.iter().enumerate() {
            if name.is_empty() || record.fields.contains_key(name) {
                continue;
            }
            let raw = table.cell(row, col);
            let value = if col == id_idx {
                CellValue::Text(identifier.clone())
            } else if spec.flag_columns.contains(name) {
                CellValue::text(normalize_flag(raw))
            } else if spec.date_columns.contains(name) {
                match parse_sheet_date(raw) {
                    DateCell::Valid(date) => CellValue::Date(date),
                    DateCell::Empty => CellValue::Blank,
                    DateCell::Invalid => {
                        *metrics.invalid_dates.entry(name.clone()).or_default() += 1;
                        let samples = invalid_samples.entry(name.clone()).or_default();
                        if samples.len() < spec.max_samples {
                            samples.push(ParseWarning {
                                column: name.clone(),
                                identifier: identifier.clone(),
                                raw_value: raw.to_string(),
                            });
                        }
                        CellValue::Blank
                    }
                }
            } else {
                CellValue::text(raw)
            };
            record.set(name.clone(), value);
        }
        records.push(record);
    }

    metrics.rows_after_id_filter = records.len();
    let records = keep_last_occurrence(records);
    metrics.duplicates_dropped = metrics.rows_after_id_filter - records.len();

    let mut columns: Vec<String> = Vec::with_capacity(table.headers.len());
    for name in &table.headers {
        if !name.is_empty() && !columns.contains(name) {
            columns.push(name.clone());
        }
    }

    if metrics.duplicates_dropped > 0 {
        debug!(dropped = metrics.duplicates_dropped, "duplicate identifiers resolved");
    }
    info!(
        input = metrics.total_rows_input,
        kept = records.len(),
        discarded_empty_id = metrics.discarded_empty_id,
        "normalized table"
    );

    Ok(Normalized {
        snapshot: Snapshot::new(columns, records),
        metrics,
        invalid_samples,
    })
}

fn keep_last_occurrence(records: Vec<Record>) -> Vec<Record> {
    let mut seen = HashSet::new();
    let mut kept: Vec<Record> = records
        .into_iter()
        .rev()
        .filter(|r| seen.insert(r.identifier.clone()))
        .collect();
    kept.reverse();
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn table(headers: &[&str], rows: &[&[&str]]) -> RawTable {
        RawTable {
            sheet: None,
            headers: headers.iter().map(|s| s.to_string()).collect(),
            rows: rows
                .iter()
                .map(|r| r.iter().map(|s| s.to_string()).collect())
                .collect(),
        }
    }

    fn survey_table(rows: &[&[&str]]) -> RawTable {
        table(
            &[
                "Id",
                "Has Fence on Google Earth",
                "Google Earth Last Picture At",
                "Google Earth Last Checked At",
            ],
            rows,
        )
    }

    #[test]
    fn missing_required_columns_are_listed() {
        let spec = NormalizeSpec::survey(&ColumnProfile::default());
        let err = normalize(&table(&["Id", "Other"], &[]), &spec).unwrap_err();
        assert_eq!(
            err.missing,
            vec![
                "Has Fence on Google Earth",
                "Google Earth Last Picture At",
                "Google Earth Last Checked At"
            ]
        );
    }

    #[test]
    fn survey_row_normalizes_id_flag_and_serial_date() {
        let spec = NormalizeSpec::survey(&ColumnProfile::default());
        let out = normalize(&survey_table(&[&["1,024", "Y", "45292", ""]]), &spec).unwrap();
        let record = out.snapshot.find("1024").unwrap();
        assert_eq!(record.text("Has Fence on Google Earth"), "Yes");
        assert_eq!(
            record.value("Google Earth Last Picture At"),
            &CellValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
        assert!(record.value("Google Earth Last Checked At").is_blank());
    }

    #[test]
    fn duplicates_keep_last_row() {
        let spec = NormalizeSpec::survey(&ColumnProfile::default());
        let out = normalize(
            &survey_table(&[
                &["42", "No", "", ""],
                &["7", "Yes", "", ""],
                &["42.0", "Yes", "01/02/2024", ""],
            ]),
            &spec,
        )
        .unwrap();
        let ids: Vec<&str> = out.snapshot.identifiers().collect();
        assert_eq!(ids, vec!["7", "42"]);
        assert_eq!(out.snapshot.find("42").unwrap().text("Has Fence on Google Earth"), "Yes");
        assert_eq!(out.metrics.rows_after_id_filter, 3);
        assert_eq!(out.metrics.duplicates_dropped, 1);
    }

    #[test]
    fn empty_ids_are_discarded_and_bad_dates_sampled() {
        let mut spec = NormalizeSpec::survey(&ColumnProfile::default());
        spec.max_samples = 1;
        let out = normalize(
            &survey_table(&[
                &["", "Yes", "", ""],
                &["nan", "Yes", "", ""],
                &["1", "maybe", "not a date", "60001"],
                &["2", "", "garbage", "-"],
            ]),
            &spec,
        )
        .unwrap();

        assert_eq!(out.metrics.total_rows_input, 4);
        assert_eq!(out.metrics.discarded_empty_id, 2);
        assert_eq!(out.metrics.invalid_dates["Google Earth Last Picture At"], 2);
        assert_eq!(out.metrics.invalid_dates["Google Earth Last Checked At"], 1);
        assert_eq!(out.invalid_samples["Google Earth Last Picture At"].len(), 1);
        assert_eq!(
            out.invalid_samples["Google Earth Last Picture At"][0].raw_value,
            "not a date"
        );
        assert_eq!(out.snapshot.find("1").unwrap().text("Has Fence on Google Earth"), "");
    }

    #[test]
    fn leads_spec_keeps_cells_as_text() {
        let spec = NormalizeSpec::leads(&ColumnProfile::default());
        let out = normalize(
            &table(&["Id", "ZipCode", "Notes"], &[&["0012", "07030", " hello "]]),
            &spec,
        )
        .unwrap();
        let record = out.snapshot.find("12").unwrap();
        assert_eq!(record.value("ZipCode"), &CellValue::Text("07030".into()));
        assert_eq!(record.text("Notes"), "hello");
        assert_eq!(record.text("Id"), "12");
    }

    #[test]
    fn leads_spec_normalizes_overlay_columns_when_present() {
        let spec = NormalizeSpec::leads(&ColumnProfile::default());
        assert_eq!(spec.required, vec!["Id"]);
        let out = normalize(
            &table(
                &["Id", "Has Fence on Google Earth", "Google Earth Last Picture At"],
                &[&["1", "y", "garbage"], &["2", "TRUE", "45292"]],
            ),
            &spec,
        )
        .unwrap();
        assert_eq!(out.snapshot.find("1").unwrap().text("Has Fence on Google Earth"), "Yes");
        assert_eq!(out.snapshot.find("2").unwrap().text("Has Fence on Google Earth"), "Yes");
        assert_eq!(
            out.invalid_samples["Google Earth Last Picture At"][0].raw_value,
            "garbage"
        );
    }
}
