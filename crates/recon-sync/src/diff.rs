//! Added / modified / unchanged classification between two snapshots.

use std::collections::{HashMap, HashSet};

use recon_core::{Record, Snapshot};
use serde::{Deserialize, Serialize};

pub const DIFF_SAMPLE_LIMIT: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
    /// In the baseline only. Reported, never part of the replace decision.
    pub removed: Vec<String>,
    pub total_new: usize,
    pub total_baseline: usize,
    pub added_sample: Vec<String>,
    pub modified_sample: Vec<String>,
}

impl DiffSummary {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn modified_count(&self) -> usize {
        self.modified.len()
    }

    pub fn unchanged_count(&self) -> usize {
        self.unchanged.len()
    }
}

fn field_tuple(record: &Record, fields: &[&str]) -> Vec<String> {
    fields.iter().map(|f| record.text(f)).collect()
}

/// Identifiers sort numerically when both are integers, lexically otherwise.
fn id_order(a: &String, b: &String) -> std::cmp::Ordering {
    match (a.parse::<i64>(), b.parse::<i64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Classifies every identifier of `new` against `baseline`, comparing only `fields`.
pub fn diff_snapshots(new: &Snapshot, baseline: &Snapshot, fields: &[&str]) -> DiffSummary {
    let baseline_by_id: HashMap<&str, &Record> = baseline
        .records()
        .iter()
        .map(|r| (r.identifier.as_str(), r))
        .collect();

    let mut summary = DiffSummary {
        total_new: new.len(),
        total_baseline: baseline.len(),
        ..Default::default()
    };

    for record in new.records() {
        match baseline_by_id.get(record.identifier.as_str()) {
            None => summary.added.push(record.identifier.clone()),
            Some(old) if field_tuple(record, fields) != field_tuple(old, fields) => {
                summary.modified.push(record.identifier.clone())
            }
            Some(_) => summary.unchanged.push(record.identifier.clone()),
        }
    }

    let new_ids: HashSet<&str> = new.identifiers().collect();
    summary.removed = baseline
        .records()
        .iter()
        .filter(|r| !new_ids.contains(r.identifier.as_str()))
        .map(|r| r.identifier.clone())
        .collect();

    for ids in [
        &mut summary.added,
        &mut summary.modified,
        &mut summary.unchanged,
        &mut summary.removed,
    ] {
        ids.sort_by(id_order);
    }
    summary.added_sample = summary.added.iter().take(DIFF_SAMPLE_LIMIT).cloned().collect();
    summary.modified_sample = summary.modified.iter().take(DIFF_SAMPLE_LIMIT).cloned().collect();
    summary
}

pub fn should_replace_baseline(summary: &DiffSummary) -> bool {
    summary.added_count() + summary.modified_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_core::CellValue;

    const FIELDS: [&str; 3] = ["Flag", "A", "B"];

    fn snapshot(rows: &[(&str, &str, &str, &str, &str)]) -> Snapshot {
        let records = rows
            .iter()
            .map(|(id, flag, a, b, other)| {
                let mut r = Record::new(*id);
                r.set("Flag", CellValue::text(flag));
                r.set("A", CellValue::text(a));
                r.set("B", CellValue::text(b));
                r.set("Other", CellValue::text(other));
                r
            })
            .collect();
        Snapshot::new(
            ["Id", "Flag", "A", "B", "Other"].iter().map(|s| s.to_string()).collect(),
            records,
        )
    }

    #[test]
    fn empty_baseline_marks_everything_added() {
        let new = snapshot(&[("1", "Yes", "", "", ""), ("2", "No", "", "", "")]);
        let summary = diff_snapshots(&new, &Snapshot::empty(), &FIELDS);
        assert_eq!(summary.added_count(), 2);
        assert_eq!(summary.modified_count(), 0);
        assert_eq!(summary.unchanged_count(), 0);
        assert!(should_replace_baseline(&summary));
    }

    #[test]
    fn only_tracked_fields_count_as_changes() {
        let baseline = snapshot(&[
            ("1", "Yes", "01/01/2024", "", "x"),
            ("2", "No", "", "", "x"),
            ("5", "No", "", "", ""),
        ]);
        let new = snapshot(&[
            ("10", "Yes", "", "", ""),
            ("1", "Yes", "01/01/2024", "", "changed"),
            ("2", "Yes", "", "", "x"),
        ]);
        let summary = diff_snapshots(&new, &baseline, &FIELDS);
        assert_eq!(summary.added, vec!["10"]);
        assert_eq!(summary.modified, vec!["2"]);
        assert_eq!(summary.unchanged, vec!["1"]);
        assert_eq!(summary.removed, vec!["5"]);
        assert_eq!(
            summary.added.len() + summary.modified.len() + summary.unchanged.len(),
            new.len()
        );
    }

    #[test]
    fn identical_snapshots_keep_baseline() {
        let rows = [("1", "Yes", "", "", ""), ("2", "No", "", "", "")];
        let summary = diff_snapshots(&snapshot(&rows), &snapshot(&rows), &FIELDS);
        assert!(!should_replace_baseline(&summary));
        assert_eq!(summary.unchanged, vec!["1", "2"]);
    }

    #[test]
    fn samples_are_capped_and_sorted() {
        let rows: Vec<(String, &str, &str, &str, &str)> = (1..=25)
            .rev()
            .map(|i| (i.to_string(), "Yes", "", "", ""))
            .collect();
        let borrowed: Vec<(&str, &str, &str, &str, &str)> = rows
            .iter()
            .map(|(id, f, a, b, o)| (id.as_str(), *f, *a, *b, *o))
            .collect();
        let summary = diff_snapshots(&snapshot(&borrowed), &Snapshot::empty(), &FIELDS);
        assert_eq!(summary.added_sample.len(), DIFF_SAMPLE_LIMIT);
        assert_eq!(summary.added_sample[0], "1");
        assert_eq!(summary.added_sample[9], "10");
    }

    #[test]
    fn large_disjoint_snapshots_report_every_removal() {
        let build = |range: std::ops::Range<usize>| {
            let records = range
                .map(|i| {
                    let mut r = Record::new(i.to_string());
                    r.set("Flag", CellValue::text("Yes"));
                    r
                })
                .collect();
            Snapshot::new(vec!["Id".to_string(), "Flag".to_string()], records)
        };
        let baseline = build(0..50_000);
        let new = build(50_000..100_000);

        let started = std::time::Instant::now();
        let summary = diff_snapshots(&new, &baseline, &FIELDS);
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
        assert_eq!(summary.added_count(), 50_000);
        assert_eq!(summary.removed.len(), 50_000);
        assert_eq!(summary.removed[0], "0");
        assert_eq!(summary.removed[49_999], "49999");
    }
}
