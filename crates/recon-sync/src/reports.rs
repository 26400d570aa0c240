//! Run artifacts under `<reports>/<run_id>/`: exports, summary, manifest and the
//! acknowledgment marker.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use recon_storage::sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::info;
use uuid::Uuid;

use crate::pipeline::{LeadsPipeline, LeadsReport, RunSummary};

const SUMMARY_FILE: &str = "summary.json";
const MANIFEST_FILE: &str = "manifest.json";
const ACK_FILE: &str = "acknowledged.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Csv,
    Xlsx,
}

impl ExportFormat {
    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Csv => "text/csv; charset=utf-8",
            Self::Xlsx => recon_storage::SPREADSHEET_MIME,
        }
    }

    fn file_name<'a>(&self, summary: &'a RunSummary) -> &'a str {
        match self {
            Self::Csv => &summary.csv_file_name,
            Self::Xlsx => &summary.xlsx_file_name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub generated_at: DateTime<Utc>,
    pub files: Vec<ManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckOutcome {
    pub run_id: Uuid,
    pub acknowledged_at: DateTime<Utc>,
    pub updated: usize,
    /// True when the marker already existed and no call was made.
    #[serde(default)]
    pub already_acknowledged: bool,
}

fn run_dir(reports_dir: &Path, run_id: Uuid) -> PathBuf {
    reports_dir.join(run_id.to_string())
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path, bytes: &[u8]) -> ManifestFile {
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    ManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(bytes),
        bytes: bytes.len() as u64,
    }
}

async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    fs::write(path, text)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T> {
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Writes both exports, `summary.json` and `manifest.json`. Returns the run directory.
pub async fn write_run_artifacts(reports_dir: &Path, report: &LeadsReport) -> Result<PathBuf> {
    let summary = &report.summary;
    let dir = run_dir(reports_dir, summary.run_id);
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let mut files = Vec::new();
    for (name, bytes) in [
        (summary.csv_file_name.as_str(), report.final_csv.as_slice()),
        (summary.xlsx_file_name.as_str(), report.final_xlsx.as_slice()),
    ] {
        let path = dir.join(name);
        fs::write(&path, bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;
        files.push(manifest_entry(name, reports_dir, &path, bytes));
    }

    let summary_path = dir.join(SUMMARY_FILE);
    write_json(&summary_path, summary).await?;
    let summary_bytes = fs::read(&summary_path)
        .await
        .with_context(|| format!("reading {}", summary_path.display()))?;
    files.push(manifest_entry(SUMMARY_FILE, reports_dir, &summary_path, &summary_bytes));

    let manifest = RunManifest {
        run_id: summary.run_id,
        generated_at: Utc::now(),
        files,
    };
    write_json(&dir.join(MANIFEST_FILE), &manifest).await?;

    info!(run_id = %summary.run_id, dir = %dir.display(), "run artifacts written");
    Ok(dir)
}

/// `None` when no run with that id was written.
pub async fn load_run(reports_dir: &Path, run_id: Uuid) -> Result<Option<RunSummary>> {
    let path = run_dir(reports_dir, run_id).join(SUMMARY_FILE);
    if !fs::try_exists(&path).await.unwrap_or(false) {
        return Ok(None);
    }
    read_json(&path).await.map(Some)
}

/// At most `limit` runs, newest first. Directories without a readable summary are
/// skipped.
pub async fn list_runs(reports_dir: &Path, limit: usize) -> Result<Vec<RunSummary>> {
    if !fs::try_exists(reports_dir).await.unwrap_or(false) {
        return Ok(Vec::new());
    }
    let mut entries = fs::read_dir(reports_dir)
        .await
        .with_context(|| format!("reading {}", reports_dir.display()))?;

    let mut runs = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .with_context(|| format!("reading {}", reports_dir.display()))?
    {
        let Some(run_id) = entry
            .file_name()
            .to_str()
            .and_then(|name| Uuid::parse_str(name).ok())
        else {
            continue;
        };
        if let Ok(Some(summary)) = load_run(reports_dir, run_id).await {
            runs.push(summary);
        }
    }

    runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    runs.truncate(limit);
    Ok(runs)
}

/// Export bytes of a stored run; `None` for an unknown run.
pub async fn read_export(
    reports_dir: &Path,
    run_id: Uuid,
    format: ExportFormat,
) -> Result<Option<(String, Vec<u8>)>> {
    let Some(summary) = load_run(reports_dir, run_id).await? else {
        return Ok(None);
    };
    let name = format.file_name(&summary).to_string();
    let path = run_dir(reports_dir, run_id).join(&name);
    let bytes = fs::read(&path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    Ok(Some((name, bytes)))
}

/// Marks a stored run's processed update ids applied, once. A second call returns
/// the recorded outcome without touching the data store. `None` for an unknown run.
///
/// Store failures surface as a `PipelineError` inside the `anyhow::Error`.
pub async fn acknowledge_run(
    pipeline: &LeadsPipeline,
    reports_dir: &Path,
    run_id: Uuid,
) -> Result<Option<AckOutcome>> {
    let Some(summary) = load_run(reports_dir, run_id).await? else {
        return Ok(None);
    };

    let marker = run_dir(reports_dir, run_id).join(ACK_FILE);
    if fs::try_exists(&marker).await.unwrap_or(false) {
        let mut outcome: AckOutcome = read_json(&marker).await?;
        outcome.already_acknowledged = true;
        info!(run_id = %run_id, "run already acknowledged");
        return Ok(Some(outcome));
    }

    let updated = pipeline.acknowledge(&summary.processed_update_ids).await?;
    let outcome = AckOutcome {
        run_id,
        acknowledged_at: Utc::now(),
        updated,
        already_acknowledged: false,
    };
    write_json(&marker, &outcome).await?;
    info!(run_id = %run_id, updated, "run acknowledged");
    Ok(Some(outcome))
}

pub async fn report_runs_markdown(reports_dir: &Path, limit: usize) -> Result<String> {
    let runs = list_runs(reports_dir, limit).await?;
    let mut lines = vec!["# Leads Runs".to_string(), String::new()];
    if runs.is_empty() {
        lines.push("_no runs recorded_".to_string());
    }
    for run in runs {
        let acknowledged = fs::try_exists(run_dir(reports_dir, run.run_id).join(ACK_FILE))
            .await
            .unwrap_or(false);
        lines.push(format!("## Run `{}`", run.run_id));
        lines.push(format!("- business date: {}", run.business_date));
        lines.push(format!("- records: {}", run.record_count));
        lines.push(format!(
            "- added / modified / unchanged: {} / {} / {}",
            run.added, run.modified, run.unchanged
        ));
        lines.push(format!(
            "- processed updates: {} (acknowledged: {})",
            run.processed_update_ids.len(),
            if acknowledged { "yes" } else { "no" }
        ));
        lines.push(format!("- exports: `{}`, `{}`", run.csv_file_name, run.xlsx_file_name));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use recon_core::{ColumnProfile, PendingUpdate};
    use recon_storage::{MemoryDataStore, MemoryFileStore};
    use tempfile::tempdir;

    use crate::config::ReconConfig;
    use crate::pipeline::{LeadsOptions, UploadedFile};

    async fn run_once(store: Arc<MemoryDataStore>) -> (LeadsPipeline, LeadsReport) {
        let pipeline = LeadsPipeline::new(
            ReconConfig::default(),
            ColumnProfile::default(),
            store,
            Arc::new(MemoryFileStore::new()),
        );
        let report = pipeline
            .run(
                &UploadedFile::new("leads.csv", b"Id,Email\n1,a@example.com\n2,b@example.com\n".to_vec()),
                None,
                LeadsOptions {
                    skip_remote: false,
                    skip_overlay: true,
                },
            )
            .await
            .unwrap();
        (pipeline, report)
    }

    fn store() -> Arc<MemoryDataStore> {
        let updates: Vec<PendingUpdate> =
            serde_json::from_str(r#"[{"id": "u1", "lead": "2", "asked_for_no_contact": "Yes"}]"#)
                .unwrap();
        Arc::new(MemoryDataStore::new(updates))
    }

    #[tokio::test]
    async fn artifacts_round_trip_through_the_reports_dir() {
        let dir = tempdir().unwrap();
        let (_, report) = run_once(store()).await;
        let run_dir = write_run_artifacts(dir.path(), &report).await.unwrap();

        let manifest: RunManifest = read_json(&run_dir.join(MANIFEST_FILE)).await.unwrap();
        assert_eq!(manifest.files.len(), 3);
        assert_eq!(manifest.files[0].sha256, sha256_hex(&report.final_csv));
        assert_eq!(manifest.files[0].bytes, report.final_csv.len() as u64);

        let loaded = load_run(dir.path(), report.summary.run_id).await.unwrap().unwrap();
        assert_eq!(loaded, report.summary);

        let (name, bytes) = read_export(dir.path(), report.summary.run_id, ExportFormat::Csv)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(name, report.summary.csv_file_name);
        assert_eq!(bytes, report.final_csv);

        assert!(load_run(dir.path(), Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn runs_are_listed_newest_first() {
        let dir = tempdir().unwrap();
        let (_, first) = run_once(store()).await;
        let (_, second) = run_once(store()).await;
        write_run_artifacts(dir.path(), &first).await.unwrap();
        write_run_artifacts(dir.path(), &second).await.unwrap();
        std::fs::create_dir_all(dir.path().join("not-a-run")).unwrap();

        let runs = list_runs(dir.path(), 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs[0].started_at >= runs[1].started_at);
        assert!(list_runs(dir.path(), 0).await.unwrap().is_empty());

        let markdown = report_runs_markdown(dir.path(), 1).await.unwrap();
        assert!(markdown.starts_with("# Leads Runs"));
        assert_eq!(markdown.matches("## Run").count(), 1);
    }

    #[tokio::test]
    async fn acknowledgment_happens_once() {
        let dir = tempdir().unwrap();
        let data = store();
        let (pipeline, report) = run_once(data.clone()).await;
        assert_eq!(report.summary.processed_update_ids, vec!["u1"]);
        write_run_artifacts(dir.path(), &report).await.unwrap();

        let first = acknowledge_run(&pipeline, dir.path(), report.summary.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.updated, 1);
        assert!(!first.already_acknowledged);
        assert!(data.applied().contains_key("u1"));

        let again = acknowledge_run(&pipeline, dir.path(), report.summary.run_id)
            .await
            .unwrap()
            .unwrap();
        assert!(again.already_acknowledged);
        assert_eq!(again.updated, 1);

        assert!(acknowledge_run(&pipeline, dir.path(), Uuid::new_v4())
            .await
            .unwrap()
            .is_none());
    }
}
