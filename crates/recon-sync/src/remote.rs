//! Applies pending remote updates to matching records.

use recon_core::{format_us_date, CellValue, ColumnProfile, PendingUpdate, Record, Snapshot};
use recon_storage::{DataStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cleanup::parse_any_datetime;
use crate::identity::{normalize_email, IdentityIndex, MatchedBy};

pub const UNMATCHED_SAMPLE_LIMIT: usize = 20;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub fetched: usize,
    pub matched_by_identifier: usize,
    pub matched_by_email: usize,
    /// Neither an identifier nor an email was supplied.
    pub unmatched_without_key: usize,
    /// A key was supplied but no record carries it.
    pub unmatched_not_found: usize,
    pub fields_written: usize,
    pub columns_added: usize,
}

impl MergeStats {
    pub fn matched(&self) -> usize {
        self.matched_by_identifier + self.matched_by_email
    }

    pub fn unmatched(&self) -> usize {
        self.unmatched_without_key + self.unmatched_not_found
    }
}

/// A pending update or overlay row that matched no record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmatchedRecordWarning {
    pub update_id: Option<String>,
    pub identifier: Option<String>,
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub snapshot: Snapshot,
    pub stats: MergeStats,
    pub processed_ids: Vec<String>,
    pub unmatched_samples: Vec<UnmatchedRecordWarning>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !recon_core::is_effectively_empty(v))
}

/// Remote date values are rewritten `MM/DD/YYYY`; unparseable dates become blank.
fn remote_cell(raw: &str, is_date: bool) -> CellValue {
    if !is_date {
        return CellValue::text(raw);
    }
    match parse_any_datetime(raw) {
        Some(dt) => CellValue::Text(format_us_date(dt.date())),
        None => CellValue::Blank,
    }
}

/// Matches each update to at most one record (identifier first, then email) and
/// writes the mapped fields it carries. Null payload values are skipped.
pub fn merge_updates(
    snapshot: &Snapshot,
    updates: &[PendingUpdate],
    profile: &ColumnProfile,
) -> MergeOutcome {
    let keys = &profile.remote_keys;
    let index = IdentityIndex::build(snapshot, Some(&profile.email_column));
    let mut columns = snapshot.columns().to_vec();
    let mut records: Vec<Record> = snapshot.records().to_vec();
    let mut stats = MergeStats {
        fetched: updates.len(),
        ..Default::default()
    };
    let mut processed_ids = Vec::new();
    let mut unmatched_samples = Vec::new();

    for mapping in &profile.remote_fields {
        if !columns.contains(&mapping.column) {
            columns.push(mapping.column.clone());
            stats.columns_added += 1;
        }
    }

    for update in updates {
        let identifier = non_empty(update.field_text(&keys.identifier));
        let email = non_empty(update.field_text(&keys.email)).and_then(|e| normalize_email(&e));

        if identifier.is_none() && email.is_none() {
            stats.unmatched_without_key += 1;
            if unmatched_samples.len() < UNMATCHED_SAMPLE_LIMIT {
                unmatched_samples.push(UnmatchedRecordWarning {
                    update_id: update.id.clone(),
                    identifier,
                    email,
                });
            }
            continue;
        }

        let Some((pos, matched_by)) = index.resolve(identifier.as_deref(), email.as_deref()) else {
            stats.unmatched_not_found += 1;
            if unmatched_samples.len() < UNMATCHED_SAMPLE_LIMIT {
                unmatched_samples.push(UnmatchedRecordWarning {
                    update_id: update.id.clone(),
                    identifier,
                    email,
                });
            }
            continue;
        };

        match matched_by {
            MatchedBy::Identifier => stats.matched_by_identifier += 1,
            MatchedBy::Email => stats.matched_by_email += 1,
        }

        let record = &mut records[pos];
        for mapping in &profile.remote_fields {
            let Some(raw) = update.field_text(&mapping.remote_key) else {
                continue;
            };
            record.set(mapping.column.clone(), remote_cell(&raw, mapping.is_date));
            stats.fields_written += 1;
        }

        if let Some(id) = &update.id {
            processed_ids.push(id.clone());
        }
    }

    if stats.unmatched() > 0 {
        warn!(
            without_key = stats.unmatched_without_key,
            not_found = stats.unmatched_not_found,
            "pending updates left unmatched"
        );
    }
    info!(
        fetched = stats.fetched,
        matched = stats.matched(),
        fields_written = stats.fields_written,
        processed = processed_ids.len(),
        "remote updates merged"
    );

    MergeOutcome {
        snapshot: Snapshot::new(columns, records),
        stats,
        processed_ids,
        unmatched_samples,
    }
}

/// One fetch from the data store, then a pure merge.
pub async fn fetch_and_merge(
    store: &dyn DataStore,
    snapshot: &Snapshot,
    profile: &ColumnProfile,
) -> Result<MergeOutcome, StoreError> {
    let updates = store.fetch_pending_updates().await?;
    Ok(merge_updates(snapshot, &updates, profile))
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_storage::MemoryDataStore;

    fn leads() -> Snapshot {
        let rows = [("1024", "ana@example.com"), ("2048", "bo@example.com")];
        let records = rows
            .iter()
            .map(|(id, email)| {
                let mut r = Record::new(*id);
                r.set("Id", CellValue::text(id));
                r.set("Email", CellValue::text(email));
                r.set("Asked For No Contact", CellValue::text("No"));
                r
            })
            .collect();
        Snapshot::new(
            vec!["Id".into(), "Email".into(), "Asked For No Contact".into()],
            records,
        )
    }

    fn updates(json: &str) -> Vec<PendingUpdate> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn matched_update_writes_field_and_records_id() {
        let profile = ColumnProfile::default();
        let out = merge_updates(
            &leads(),
            &updates(r#"[{"id": "u1", "lead": "1024", "asked_for_no_contact": "Yes"}]"#),
            &profile,
        );
        assert_eq!(out.snapshot.find("1024").unwrap().text("Asked For No Contact"), "Yes");
        assert_eq!(out.processed_ids, vec!["u1"]);
        assert_eq!(out.stats.matched_by_identifier, 1);
        assert_eq!(out.stats.fields_written, 1);
    }

    #[test]
    fn email_fallback_and_date_reformat() {
        let profile = ColumnProfile::default();
        let out = merge_updates(
            &leads(),
            &updates(
                r#"[{"id": 7, "lead": null, "email": " BO@example.com ",
                     "asked_contact_next_year_date": "2025-02-03T10:00:00+00:00",
                     "asked_contact_next_year": "Yes",
                     "asked_for_no_contact": null,
                     "asked_contact_for_promos_date": "someday"}]"#,
            ),
            &profile,
        );
        let r = out.snapshot.find("2048").unwrap();
        assert_eq!(r.text("Asked Contact Next Year Date"), "02/03/2025");
        assert_eq!(r.text("Asked Contact Next Year"), "Yes");
        assert_eq!(r.text("Asked For No Contact"), "No");
        assert_eq!(r.text("Asked Contact For Promos Date"), "");
        assert_eq!(out.stats.matched_by_email, 1);
        assert_eq!(out.processed_ids, vec!["7"]);
        assert!(out.snapshot.has_column("Asked Contact Next Year Date"));
    }

    #[test]
    fn unmatched_updates_are_counted_separately() {
        let profile = ColumnProfile::default();
        let out = merge_updates(
            &leads(),
            &updates(
                r#"[{"id": "a", "asked_for_no_contact": "Yes"},
                    {"id": "b", "lead": "9999", "asked_for_no_contact": "Yes"},
                    {"id": "c", "email": "nobody@example.com"}]"#,
            ),
            &profile,
        );
        assert_eq!(out.stats.unmatched_without_key, 1);
        assert_eq!(out.stats.unmatched_not_found, 2);
        assert_eq!(out.stats.unmatched(), 3);
        assert!(out.processed_ids.is_empty());
        assert_eq!(out.unmatched_samples.len(), 3);
        assert_eq!(out.snapshot.find("1024").unwrap().text("Asked For No Contact"), "No");
    }

    #[tokio::test]
    async fn fetch_and_merge_uses_the_store_once() {
        let store = MemoryDataStore::new(updates(
            r#"[{"id": "u1", "lead": "1024", "eligible_for_emails": "No"}]"#,
        ));
        let out = fetch_and_merge(&store, &leads(), &ColumnProfile::default())
            .await
            .unwrap();
        assert_eq!(out.snapshot.find("1024").unwrap().text("Eligible for Emails"), "No");
        assert_eq!(out.processed_ids, vec!["u1"]);
    }
}
