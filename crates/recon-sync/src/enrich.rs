//! Tracked-column insertion, defaults and back-fill from the previous snapshot.

use std::collections::HashMap;

use recon_core::{CellValue, ColumnProfile, Record, Snapshot, TrackedGroup};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentStats {
    pub columns_inserted: usize,
    pub defaults_filled: usize,
    pub pre_backfilled: usize,
    pub post_backfilled: usize,
}

impl EnrichmentStats {
    pub fn backfilled(&self) -> usize {
        self.pre_backfilled + self.post_backfilled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    BeforeAnchor,
    AfterAnchor,
}

/// Inserts the group's missing columns next to its anchor, keeping group order.
/// Without the anchor, missing columns are appended. Existing columns never move.
fn place_group(columns: &mut Vec<String>, group: &TrackedGroup, placement: Placement) -> usize {
    let mut inserted = 0;
    let mut cursor = columns.iter().position(|c| *c == group.anchor).map(|pos| match placement {
        Placement::BeforeAnchor => pos,
        Placement::AfterAnchor => pos + 1,
    });

    for name in group.names() {
        if let Some(existing) = columns.iter().position(|c| c == name) {
            if let Some(at) = cursor.as_mut() {
                if existing >= *at {
                    *at = existing + 1;
                }
            }
            continue;
        }
        match cursor.as_mut() {
            Some(at) => {
                columns.insert(*at, name.to_string());
                *at += 1;
            }
            None => columns.push(name.to_string()),
        }
        inserted += 1;
    }
    inserted
}

fn default_cell(default: &str) -> CellValue {
    CellValue::text(default)
}

/// Guarantees every tracked column exists with defaults, then back-fills from
/// `previous` by identifier.
///
/// Pre-group: a blank current cell takes any non-blank previous value. Post-group:
/// the previous value wins only when it is non-blank, differs from the default,
/// and the current value still equals the default.
pub fn enrich(
    current: &Snapshot,
    previous: Option<&Snapshot>,
    profile: &ColumnProfile,
) -> (Snapshot, EnrichmentStats) {
    let mut stats = EnrichmentStats::default();
    let mut columns = current.columns().to_vec();
    stats.columns_inserted += place_group(&mut columns, &profile.pre_group, Placement::BeforeAnchor);
    stats.columns_inserted += place_group(&mut columns, &profile.post_group, Placement::AfterAnchor);

    let previous_by_id: HashMap<&str, &Record> = previous
        .map(|p| p.records().iter().map(|r| (r.identifier.as_str(), r)).collect())
        .unwrap_or_default();

    let tracked = profile
        .pre_group
        .columns
        .iter()
        .chain(profile.post_group.columns.iter());

    let mut records: Vec<Record> = current.records().to_vec();
    for record in &mut records {
        for column in tracked.clone() {
            if record.value(&column.name).is_blank() {
                if !column.default.is_empty() {
                    stats.defaults_filled += 1;
                }
                record.set(column.name.clone(), default_cell(&column.default));
            }
        }

        let Some(prev) = previous_by_id.get(record.identifier.as_str()) else {
            continue;
        };

        for column in &profile.pre_group.columns {
            let prev_value = prev.value(&column.name);
            if record.value(&column.name).is_blank() && !prev_value.is_blank() {
                record.set(column.name.clone(), prev_value.clone());
                stats.pre_backfilled += 1;
            }
        }

        for column in &profile.post_group.columns {
            let prev_value = prev.value(&column.name);
            let prev_text = prev_value.render();
            if !prev_value.is_blank()
                && prev_text != column.default
                && record.text(&column.name) == column.default
            {
                record.set(column.name.clone(), prev_value.clone());
                stats.post_backfilled += 1;
            }
        }
    }

    info!(
        columns_inserted = stats.columns_inserted,
        defaults_filled = stats.defaults_filled,
        pre_backfilled = stats.pre_backfilled,
        post_backfilled = stats.post_backfilled,
        "enrichment applied"
    );

    (Snapshot::new(columns, records), stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(columns: &[&str], rows: &[(&str, &[(&str, &str)])]) -> Snapshot {
        let records = rows
            .iter()
            .map(|(id, cells)| {
                let mut r = Record::new(*id);
                r.set("Id", CellValue::text(id));
                for (c, v) in cells.iter() {
                    r.set(*c, CellValue::text(v));
                }
                r
            })
            .collect();
        Snapshot::new(columns.iter().map(|c| c.to_string()).collect(), records)
    }

    #[test]
    fn groups_land_around_their_anchors() {
        let profile = ColumnProfile::default();
        let current = snapshot(&["Id", "ZipCode", "LeadStatus", "Owner"], &[("1", &[])]);
        let (out, stats) = enrich(&current, None, &profile);

        let expected: Vec<&str> = vec![
            "Id",
            "Has Fence on Google Earth",
            "Google Earth Last Picture At",
            "Google Earth Last Checked At",
            "ZipCode",
            "LeadStatus",
            "Asked To Be Contacted On",
            "Asked Contact For Promos Date",
            "Asked Contact For Promos",
            "Asked Contact Next Year Date",
            "Asked Contact Next Year",
            "Asked For No Contact",
            "Eligible for Emails",
            "Owner",
        ];
        assert_eq!(out.columns(), expected.as_slice());
        assert_eq!(stats.columns_inserted, 10);

        let r = out.find("1").unwrap();
        assert_eq!(r.text("Asked For No Contact"), "No");
        assert_eq!(r.text("Eligible for Emails"), "Yes");
        assert_eq!(r.text("Has Fence on Google Earth"), "");
    }

    #[test]
    fn missing_anchor_appends_and_rerun_is_stable() {
        let profile = ColumnProfile::default();
        let current = snapshot(&["Id"], &[("1", &[])]);
        let (once, _) = enrich(&current, None, &profile);
        assert_eq!(once.columns().len(), 11);
        assert_eq!(once.columns()[1], "Has Fence on Google Earth");

        let (twice, stats) = enrich(&once, None, &profile);
        assert_eq!(twice.columns(), once.columns());
        assert_eq!(stats.columns_inserted, 0);
        assert_eq!(twice, once);
    }

    #[test]
    fn post_group_backfill_respects_explicit_values() {
        let profile = ColumnProfile::default();
        let current = snapshot(
            &["Id", "LeadStatus"],
            &[
                ("1", &[("Asked For No Contact", "No")]),
                ("2", &[("Asked For No Contact", "Maybe")]),
                ("3", &[]),
            ],
        );
        let previous = snapshot(
            &["Id"],
            &[
                ("1", &[("Asked For No Contact", "Yes")]),
                ("2", &[("Asked For No Contact", "Yes")]),
                ("3", &[("Eligible for Emails", "Yes"), ("Asked Contact For Promos", "")]),
            ],
        );

        let (out, stats) = enrich(&current, Some(&previous), &profile);
        assert_eq!(out.find("1").unwrap().text("Asked For No Contact"), "Yes");
        assert_eq!(out.find("2").unwrap().text("Asked For No Contact"), "Maybe");
        assert_eq!(out.find("3").unwrap().text("Eligible for Emails"), "Yes");
        assert_eq!(out.find("3").unwrap().text("Asked Contact For Promos"), "No");
        assert_eq!(stats.post_backfilled, 1);
    }

    #[test]
    fn pre_group_backfills_blanks_only() {
        let profile = ColumnProfile::default();
        let current = snapshot(
            &["Id", "ZipCode"],
            &[
                ("1", &[("Has Fence on Google Earth", "")]),
                ("2", &[("Has Fence on Google Earth", "No")]),
            ],
        );
        let previous = snapshot(
            &["Id"],
            &[
                ("1", &[("Has Fence on Google Earth", "Yes")]),
                ("2", &[("Has Fence on Google Earth", "Yes")]),
            ],
        );

        let (out, stats) = enrich(&current, Some(&previous), &profile);
        assert_eq!(out.find("1").unwrap().text("Has Fence on Google Earth"), "Yes");
        assert_eq!(out.find("2").unwrap().text("Has Fence on Google Earth"), "No");
        assert_eq!(stats.pre_backfilled, 1);
        assert_eq!(
            previous.find("1").unwrap().text("Has Fence on Google Earth"),
            "Yes"
        );
    }
}
