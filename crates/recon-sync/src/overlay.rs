//! Overlays the geospatial survey columns onto matching records.

use recon_core::{CellValue, ColumnProfile, OverlayColumns, Record, Snapshot};
use recon_ingest::{find_sheet_with_columns, IngestError};
use recon_storage::{FileStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::identity::IdentityIndex;
use crate::normalize::{normalize, NormalizeSpec};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayStats {
    pub source_rows: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub fields_written: usize,
    /// Why the overlay did nothing, when it did nothing.
    pub skipped: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OverlayResult {
    pub snapshot: Snapshot,
    pub stats: OverlayStats,
}

impl OverlayResult {
    fn skipped(snapshot: &Snapshot, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        info!(reason = %reason, "overlay skipped");
        Self {
            snapshot: snapshot.clone(),
            stats: OverlayStats {
                skipped: Some(reason),
                ..Default::default()
            },
        }
    }
}

/// Parses survey workbook bytes into a normalized snapshot. `Ok(None)` when no sheet
/// carries the identifier and all three overlay columns.
pub fn load_overlay_source(
    bytes: &[u8],
    profile: &ColumnProfile,
) -> Result<Option<Snapshot>, IngestError> {
    let spec = NormalizeSpec::survey(profile);
    let Some(table) = find_sheet_with_columns(bytes, &spec.required_refs())? else {
        return Ok(None);
    };
    // The sheet scan already guarantees the required columns.
    Ok(normalize(&table, &spec).ok().map(|n| n.snapshot))
}

/// Writes overlay values by identifier only. Flags are written only when `Yes` or
/// `No`, dates only when present, and nothing is written when the value is already
/// equal.
pub fn apply_overlay(
    snapshot: &Snapshot,
    source: &Snapshot,
    columns: &OverlayColumns,
) -> (Snapshot, OverlayStats) {
    let index = IdentityIndex::build(snapshot, None);
    let mut out_columns = snapshot.columns().to_vec();
    for name in columns.all() {
        if !out_columns.iter().any(|c| c == name) {
            out_columns.push(name.to_string());
        }
    }

    let mut records: Vec<Record> = snapshot.records().to_vec();
    let mut stats = OverlayStats {
        source_rows: source.len(),
        ..Default::default()
    };

    for row in source.records() {
        let Some(pos) = index.by_identifier(&row.identifier) else {
            stats.unmatched += 1;
            continue;
        };
        stats.matched += 1;
        let record = &mut records[pos];

        for name in columns.all() {
            let incoming = row.value(name);
            let usable = if name == columns.flag {
                matches!(incoming, CellValue::Text(flag) if flag == "Yes" || flag == "No")
            } else {
                !incoming.is_blank()
            };
            if usable && record.text(name) != incoming.render() {
                record.set(name, CellValue::Text(incoming.render()));
                stats.fields_written += 1;
            }
        }
    }

    info!(
        source_rows = stats.source_rows,
        matched = stats.matched,
        unmatched = stats.unmatched,
        fields_written = stats.fields_written,
        "overlay applied"
    );
    (Snapshot::new(out_columns, records), stats)
}

/// Downloads the latest survey file and overlays it. A missing object, an
/// unreadable workbook or a workbook without a matching sheet leaves the snapshot
/// unchanged; only a failed download is an error.
pub async fn overlay_from_store(
    store: &dyn FileStore,
    bucket: &str,
    key: &str,
    snapshot: &Snapshot,
    profile: &ColumnProfile,
) -> Result<OverlayResult, StoreError> {
    let Some(bytes) = store.download(bucket, key).await? else {
        return Ok(OverlayResult::skipped(
            snapshot,
            format!("no object at {bucket}/{key}"),
        ));
    };

    let source = match load_overlay_source(&bytes, profile) {
        Ok(Some(source)) => source,
        Ok(None) => {
            return Ok(OverlayResult::skipped(
                snapshot,
                "no sheet carries the required overlay columns",
            ))
        }
        Err(err) => {
            warn!(error = %err, "overlay workbook unreadable");
            return Ok(OverlayResult::skipped(
                snapshot,
                format!("overlay workbook unreadable: {err}"),
            ));
        }
    };

    let (snapshot, stats) = apply_overlay(snapshot, &source, &profile.overlay);
    Ok(OverlayResult { snapshot, stats })
}
