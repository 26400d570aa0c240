//! Core record model, cell coercion and column profile for the reconciliation core.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub const CRATE_NAME: &str = "recon-core";

/// Spreadsheet serial days are counted from this date (the 1900 leap-year bug baked in).
pub const SERIAL_EPOCH: (i32, u32, u32) = (1899, 12, 30);
pub const SERIAL_MIN_DAYS: i64 = 1;
pub const SERIAL_MAX_DAYS: i64 = 60_000;

pub const US_DATE_FORMAT: &str = "%m/%d/%Y";

const NULL_TOKENS: [&str; 3] = ["nan", "none", "null"];
const EMPTY_DATE_TOKENS: [&str; 2] = ["nat", "-"];

static BLANK: CellValue = CellValue::Blank;

/// Explicitly typed spreadsheet cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    #[default]
    Blank,
    Text(String),
    Number(f64),
    Date(NaiveDate),
}

impl CellValue {
    /// Single coercion point from a raw cell to a typed value.
    ///
    /// Null-like tokens become `Blank`, numeric-looking text (thousand separators
    /// allowed) becomes `Number`, `MM/DD/YYYY` / `YYYY-MM-DD` become `Date`, and
    /// everything else is kept as trimmed `Text`.
    pub fn classify(raw: &str) -> Self {
        let trimmed = raw.trim();
        if is_null_token(trimmed) {
            return Self::Blank;
        }
        if let Some(number) = parse_number(trimmed) {
            return Self::Number(number);
        }
        if let Some(date) = parse_calendar_date(trimmed) {
            return Self::Date(date);
        }
        Self::Text(trimmed.to_string())
    }

    /// Pass-through cell: trimmed text, blank when empty. No type inference.
    pub fn text(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            Self::Blank
        } else {
            Self::Text(trimmed.to_string())
        }
    }

    pub fn render(&self) -> String {
        match self {
            Self::Blank => String::new(),
            Self::Text(s) => s.clone(),
            Self::Number(n) => format_number(*n),
            Self::Date(d) => format_us_date(*d),
        }
    }

    pub fn is_blank(&self) -> bool {
        match self {
            Self::Blank => true,
            Self::Text(s) => s.trim().is_empty(),
            Self::Number(_) | Self::Date(_) => false,
        }
    }
}

fn is_null_token(trimmed: &str) -> bool {
    trimmed.is_empty()
        || NULL_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

fn parse_number(trimmed: &str) -> Option<f64> {
    let without_separators = trimmed.replace(',', "");
    if without_separators.is_empty() {
        return None;
    }
    without_separators
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

fn parse_calendar_date(trimmed: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(trimmed, US_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(trimmed, "%Y-%m-%d"))
        .ok()
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

pub fn format_us_date(date: NaiveDate) -> String {
    date.format(US_DATE_FORMAT).to_string()
}

/// Canonical join key: integer-string form for numeric values, trimmed text otherwise,
/// empty for null-like input. The empty string is never a valid key.
pub fn normalize_identifier(raw: &str) -> String {
    match CellValue::classify(raw) {
        CellValue::Blank => String::new(),
        CellValue::Number(value) => {
            let digits = raw.trim().replace(',', "");
            if digits.bytes().all(|b| b.is_ascii_digit()) {
                let stripped = digits.trim_start_matches('0');
                return if stripped.is_empty() {
                    "0".to_string()
                } else {
                    stripped.to_string()
                };
            }
            if value.fract() == 0.0 && value.abs() < 1e15 {
                format!("{}", value as i64)
            } else {
                raw.trim().to_string()
            }
        }
        CellValue::Text(text) => text,
        CellValue::Date(_) => raw.trim().to_string(),
    }
}

/// `"Yes"`, `"No"`, or `""` when the value is unknown.
pub fn normalize_flag(raw: &str) -> &'static str {
    match raw.trim().to_ascii_lowercase().as_str() {
        "yes" | "y" | "true" | "1" => "Yes",
        "no" | "n" | "false" | "0" => "No",
        _ => "",
    }
}

pub fn is_effectively_empty(raw: &str) -> bool {
    let trimmed = raw.trim();
    is_null_token(trimmed)
        || EMPTY_DATE_TOKENS
            .iter()
            .any(|token| trimmed.eq_ignore_ascii_case(token))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DateCell {
    Empty,
    Valid(NaiveDate),
    Invalid,
}

/// Date-column rule: `MM/DD/YYYY`, then `YYYY-MM-DD`, then a serial day in `1..=60000`.
pub fn parse_sheet_date(raw: &str) -> DateCell {
    if is_effectively_empty(raw) {
        return DateCell::Empty;
    }
    let trimmed = raw.trim();
    if let Some(date) = parse_calendar_date(trimmed) {
        return DateCell::Valid(date);
    }
    match parse_serial_text(trimmed) {
        Some(date) => DateCell::Valid(date),
        None => DateCell::Invalid,
    }
}

fn parse_serial_text(trimmed: &str) -> Option<NaiveDate> {
    let value = trimmed.parse::<f64>().ok().filter(|v| v.is_finite())?;
    serial_day_to_date(value.trunc() as i64)
}

pub fn serial_day_to_date(days: i64) -> Option<NaiveDate> {
    if !(SERIAL_MIN_DAYS..=SERIAL_MAX_DAYS).contains(&days) {
        return None;
    }
    let (y, m, d) = SERIAL_EPOCH;
    NaiveDate::from_ymd_opt(y, m, d)?.checked_add_days(Days::new(days as u64))
}

/// One canonical row keyed by its normalized identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub identifier: String,
    pub fields: BTreeMap<String, CellValue>,
}

impl Record {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.fields.get(column)
    }

    /// Value for `column`, blank when the column is absent.
    pub fn value(&self, column: &str) -> &CellValue {
        self.fields.get(column).unwrap_or(&BLANK)
    }

    pub fn text(&self, column: &str) -> String {
        self.value(column).render()
    }

    pub fn set(&mut self, column: impl Into<String>, value: CellValue) {
        self.fields.insert(column.into(), value);
    }
}

/// Ordered, immutable collection of records. Stages build new snapshots; they never
/// edit one they received.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    columns: Vec<String>,
    records: Vec<Record>,
}

impl Snapshot {
    pub fn new(columns: Vec<String>, records: Vec<Record>) -> Self {
        Self { columns, records }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c == name)
    }

    pub fn column_position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|r| r.identifier.as_str())
    }

    pub fn find(&self, identifier: &str) -> Option<&Record> {
        self.records.iter().find(|r| r.identifier == identifier)
    }

    /// Rendered cell text in column order, one row per record.
    pub fn to_rows(&self) -> Vec<Vec<String>> {
        self.records
            .iter()
            .map(|record| self.columns.iter().map(|c| record.text(c)).collect())
            .collect()
    }

    pub fn into_parts(self) -> (Vec<String>, Vec<Record>) {
        (self.columns, self.records)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("missing required columns: {missing:?}")]
pub struct SchemaError {
    pub missing: Vec<String>,
}

/// A cell that failed normalization. Collected, never raised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub column: String,
    pub identifier: String,
    pub raw_value: String,
}

/// Externally queued edit for one record's tracked fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    #[serde(default, deserialize_with = "loose_string")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub payload: BTreeMap<String, JsonValue>,
}

impl PendingUpdate {
    /// Text form of a payload field; `None` when absent or JSON null.
    pub fn field_text(&self, key: &str) -> Option<String> {
        self.payload.get(key).and_then(json_value_text)
    }
}

pub fn json_value_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = JsonValue::deserialize(deserializer)?;
    Ok(json_value_text(&value))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedColumn {
    pub name: String,
    #[serde(default)]
    pub default: String,
}

impl TrackedColumn {
    pub fn new(name: &str, default: &str) -> Self {
        Self {
            name: name.to_string(),
            default: default.to_string(),
        }
    }
}

/// Tracked columns inserted as a block next to an anchor column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedGroup {
    pub anchor: String,
    pub columns: Vec<TrackedColumn>,
}

impl TrackedGroup {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFieldMapping {
    pub remote_key: String,
    pub column: String,
    #[serde(default)]
    pub is_date: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteKeys {
    pub identifier: String,
    pub email: String,
    pub applied_date: String,
    pub applied_flag: String,
    pub applied_flag_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayColumns {
    pub flag: String,
    pub date_a: String,
    pub date_b: String,
}

impl OverlayColumns {
    pub fn all(&self) -> [&str; 3] {
        [&self.flag, &self.date_a, &self.date_b]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CleanupColumns {
    pub datetime: Vec<String>,
    pub date_only: Vec<String>,
    pub phone: Vec<String>,
    pub zip: String,
    pub majority_date_threshold: f64,
}

/// Every column name the reconciliation stages manage. Loadable from YAML; missing
/// keys fall back to the built-in leads profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnProfile {
    pub identifier_column: String,
    pub email_column: String,
    pub pre_group: TrackedGroup,
    pub post_group: TrackedGroup,
    pub remote_fields: Vec<RemoteFieldMapping>,
    pub remote_keys: RemoteKeys,
    pub overlay: OverlayColumns,
    pub aliases: BTreeMap<String, String>,
    pub cleanup: CleanupColumns,
}

impl ColumnProfile {
    /// Pre-group followed by post-group column names.
    pub fn tracked_columns(&self) -> Vec<&str> {
        self.pre_group.names().chain(self.post_group.names()).collect()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for ColumnProfile {
    fn default() -> Self {
        let remote = |remote_key: &str, column: &str, is_date: bool| RemoteFieldMapping {
            remote_key: remote_key.to_string(),
            column: column.to_string(),
            is_date,
        };
        let aliases = [
            ("Eligible For Emails", "Eligible for Emails"),
            ("Asked to be contacted on", "Asked To Be Contacted On"),
            ("Asked to Be Contacted On", "Asked To Be Contacted On"),
            ("Asked contact for promos date", "Asked Contact For Promos Date"),
            ("Asked contact next year date", "Asked Contact Next Year Date"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            identifier_column: "Id".to_string(),
            email_column: "Email".to_string(),
            pre_group: TrackedGroup {
                anchor: "ZipCode".to_string(),
                columns: vec![
                    TrackedColumn::new("Has Fence on Google Earth", ""),
                    TrackedColumn::new("Google Earth Last Picture At", ""),
                    TrackedColumn::new("Google Earth Last Checked At", ""),
                ],
            },
            post_group: TrackedGroup {
                anchor: "LeadStatus".to_string(),
                columns: vec![
                    TrackedColumn::new("Asked To Be Contacted On", ""),
                    TrackedColumn::new("Asked Contact For Promos Date", ""),
                    TrackedColumn::new("Asked Contact For Promos", "No"),
                    TrackedColumn::new("Asked Contact Next Year Date", ""),
                    TrackedColumn::new("Asked Contact Next Year", "No"),
                    TrackedColumn::new("Asked For No Contact", "No"),
                    TrackedColumn::new("Eligible for Emails", "Yes"),
                ],
            },
            remote_fields: vec![
                remote("asked_to_be_contacted_on", "Asked To Be Contacted On", false),
                remote("asked_contact_for_promos_date", "Asked Contact For Promos Date", true),
                remote("asked_contact_for_promos", "Asked Contact For Promos", false),
                remote("asked_contact_next_year_date", "Asked Contact Next Year Date", true),
                remote("asked_contact_next_year", "Asked Contact Next Year", false),
                remote("asked_for_no_contact", "Asked For No Contact", false),
                remote("eligible_for_emails", "Eligible for Emails", false),
            ],
            remote_keys: RemoteKeys {
                identifier: "lead".to_string(),
                email: "email".to_string(),
                applied_date: "added_to_file_date".to_string(),
                applied_flag: "added_to_file".to_string(),
                applied_flag_value: "Yes".to_string(),
            },
            overlay: OverlayColumns {
                flag: "Has Fence on Google Earth".to_string(),
                date_a: "Google Earth Last Picture At".to_string(),
                date_b: "Google Earth Last Checked At".to_string(),
            },
            aliases,
            cleanup: CleanupColumns {
                datetime: strings(&[
                    "LastActionAt",
                    "LastEmailedAt",
                    "ClosingDate",
                    "ClosedLostAt",
                    "CancelledAt",
                    "EstimateCreatedAt",
                    "EstimateModifiedAt",
                    "CreatedAt",
                    "ModifiedAt",
                ]),
                date_only: strings(&[
                    "CalendarEventAt",
                    "CalendarEventEnd",
                    "FollowUpDate",
                    "ClosedWonAt",
                    "Google Earth Last Picture At",
                    "Google Earth Last Checked At",
                ]),
                phone: strings(&[
                    "PreferredContactPhoneNumber",
                    "WorkPhoneNumber",
                    "CellPhoneNumber",
                    "SmsPhoneNumber",
                ]),
                zip: "ZipCode".to_string(),
                majority_date_threshold: 0.6,
            },
        }
    }
}
