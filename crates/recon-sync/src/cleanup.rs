//! Lead-export cleanup: date/datetime reformatting, phone and ZIP formatting.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use recon_core::{parse_sheet_date, CellValue, CleanupColumns, DateCell, Record, Snapshot};
use serde::{Deserialize, Serialize};
use tracing::info;

pub const DATETIME_OUTPUT_FORMAT: &str = "%m/%d/%Y %I:%M %p";

const NAIVE_DATETIME_FORMATS: [&str; 9] = [
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%m/%d/%Y %I:%M %p",
];

const DATE_FORMATS: [&str; 2] = ["%m/%d/%Y", "%Y-%m-%d"];

/// Textual date or datetime in any of the accepted shapes. Offsets are dropped in
/// favor of the wall-clock time written in the value.
pub fn parse_loose_datetime(raw: &str) -> Option<NaiveDateTime> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.naive_local());
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Some(dt);
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .map(|date| date.and_time(NaiveTime::MIN))
}

/// Loose datetime, falling back to a spreadsheet serial day.
pub fn parse_any_datetime(raw: &str) -> Option<NaiveDateTime> {
    parse_loose_datetime(raw).or_else(|| match parse_sheet_date(raw) {
        DateCell::Valid(date) => Some(date.and_time(NaiveTime::MIN)),
        DateCell::Empty | DateCell::Invalid => None,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhoneOutcome {
    Standard,
    Long,
    Short,
    Blank,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneCounts {
    pub std10: usize,
    pub long: usize,
    pub short: usize,
    pub blank: usize,
}

impl PhoneCounts {
    fn record(&mut self, outcome: PhoneOutcome) {
        match outcome {
            PhoneOutcome::Standard => self.std10 += 1,
            PhoneOutcome::Long => self.long += 1,
            PhoneOutcome::Short => self.short += 1,
            PhoneOutcome::Blank => self.blank += 1,
        }
    }
}

fn digits_of(raw: &str) -> String {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_suffix(".0").unwrap_or(trimmed);
    trimmed.chars().filter(char::is_ascii_digit).collect()
}

/// `(AAA) EEE-LLLL`. A leading country code `1` on 11 digits is dropped; longer
/// numbers keep everything before the last seven digits as the area code.
pub fn format_phone(raw: &str) -> (String, PhoneOutcome) {
    let mut digits = digits_of(raw);
    if digits.is_empty() {
        return (String::new(), PhoneOutcome::Blank);
    }
    if digits.len() == 11 && digits.starts_with('1') {
        digits.remove(0);
    }
    if digits.len() < 10 {
        return (String::new(), PhoneOutcome::Short);
    }

    let split = digits.len() - 7;
    let formatted = format!(
        "({}) {}-{}",
        &digits[..split],
        &digits[split..split + 3],
        &digits[split + 3..]
    );
    let outcome = if digits.len() == 10 {
        PhoneOutcome::Standard
    } else {
        PhoneOutcome::Long
    };
    (formatted, outcome)
}

/// First five digits, zero-padded on the left; blank when there are no digits.
pub fn format_zip(raw: &str) -> String {
    let digits = digits_of(raw);
    if digits.is_empty() {
        return String::new();
    }
    let head: String = digits.chars().take(5).collect();
    format!("{head:0>5}")
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub majority_date_columns: Vec<String>,
    pub majority_date_blanked: BTreeMap<String, usize>,
    pub datetime_unparsed: BTreeMap<String, usize>,
    pub date_unparsed: BTreeMap<String, usize>,
    pub phone: BTreeMap<String, PhoneCounts>,
    pub zip_blank: usize,
}

/// Applies every cleanup rule and returns a new snapshot.
///
/// `skip` names columns never considered for the majority-date rule (identifier,
/// email and the like).
pub fn clean_leads(
    snapshot: &Snapshot,
    columns: &CleanupColumns,
    skip: &[&str],
) -> (Snapshot, CleanupReport) {
    let mut report = CleanupReport::default();
    let mut records: Vec<Record> = snapshot.records().to_vec();

    let excluded = |name: &str| {
        skip.contains(&name)
            || columns.phone.iter().any(|c| c == name)
            || columns.zip == name
    };

    for name in snapshot.columns().iter().filter(|c| !excluded(c.as_str())) {
        let (non_blank, parsed) = records.iter().fold((0usize, 0usize), |(n, p), r| {
            let value = r.value(name);
            if value.is_blank() {
                (n, p)
            } else if parse_loose_datetime(&value.render()).is_some() {
                (n + 1, p + 1)
            } else {
                (n + 1, p)
            }
        });
        if non_blank == 0 || (parsed as f64) / (non_blank as f64) < columns.majority_date_threshold {
            continue;
        }

        report.majority_date_columns.push(name.clone());
        let mut blanked = 0;
        for record in &mut records {
            let value = record.value(name);
            if !value.is_blank() && parse_loose_datetime(&value.render()).is_none() {
                record.set(name.clone(), CellValue::Blank);
                blanked += 1;
            }
        }
        if blanked > 0 {
            report.majority_date_blanked.insert(name.clone(), blanked);
        }
    }

    for name in columns.datetime.iter().filter(|c| snapshot.has_column(c)) {
        let unparsed = reformat_column(&mut records, name, |dt| {
            dt.format(DATETIME_OUTPUT_FORMAT).to_string()
        });
        if unparsed > 0 {
            report.datetime_unparsed.insert(name.clone(), unparsed);
        }
    }

    for name in columns.date_only.iter().filter(|c| snapshot.has_column(c)) {
        let unparsed = reformat_column(&mut records, name, |dt| {
            dt.format(recon_core::US_DATE_FORMAT).to_string()
        });
        if unparsed > 0 {
            report.date_unparsed.insert(name.clone(), unparsed);
        }
    }

    for name in columns.phone.iter().filter(|c| snapshot.has_column(c)) {
        let mut counts = PhoneCounts::default();
        for record in &mut records {
            let (formatted, outcome) = format_phone(&record.text(name));
            counts.record(outcome);
            record.set(name.clone(), CellValue::text(&formatted));
        }
        report.phone.insert(name.clone(), counts);
    }

    if snapshot.has_column(&columns.zip) {
        for record in &mut records {
            let zip = format_zip(&record.text(&columns.zip));
            if zip.is_empty() {
                report.zip_blank += 1;
            }
            record.set(columns.zip.clone(), CellValue::text(&zip));
        }
    }

    info!(
        majority_date_columns = report.majority_date_columns.len(),
        datetime_unparsed = report.datetime_unparsed.values().sum::<usize>(),
        zip_blank = report.zip_blank,
        "cleanup applied"
    );

    (Snapshot::new(snapshot.columns().to_vec(), records), report)
}

/// Rewrites non-blank cells through `render`; unparseable cells become blank.
/// Returns the number of blanked cells.
fn reformat_column<F>(records: &mut [Record], column: &str, render: F) -> usize
where
    F: Fn(NaiveDateTime) -> String,
{
    let mut unparsed = 0;
    for record in records.iter_mut() {
        let value = record.value(column).clone();
        let next = match value {
            CellValue::Blank => continue,
            CellValue::Date(date) => CellValue::Text(render(date.and_time(NaiveTime::MIN))),
            other => match parse_any_datetime(&other.render()) {
                Some(dt) => CellValue::Text(render(dt)),
                None if other.is_blank() => CellValue::Blank,
                None => {
                    unparsed += 1;
                    CellValue::Blank
                }
            },
        };
        record.set(column.to_string(), next);
    }
    unparsed
}
