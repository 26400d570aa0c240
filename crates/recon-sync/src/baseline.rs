//! Geospatial survey baseline: compare a new workbook with the stored one and
//! replace it when anything changed.

use std::sync::Arc;

use recon_core::{ColumnProfile, Snapshot};
use recon_ingest::{
    find_sheet_with_columns, read_workbook, IngestError, RawTable, SpreadsheetKind,
};
use recon_storage::FileStore;
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};

use crate::config::ReconConfig;
use crate::diff::{diff_snapshots, should_replace_baseline, DiffSummary};
use crate::normalize::{normalize, InvalidSamples, NormalizeMetrics, NormalizeSpec, Normalized};
use crate::{PipelineError, Stage};

pub const DEFAULT_LINK_TTL_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaselineComparison {
    pub summary: DiffSummary,
    pub replace_baseline: bool,
    /// The new file was uploaded as the baseline during this call.
    pub replaced: bool,
    pub new_metrics: NormalizeMetrics,
    pub baseline_metrics: NormalizeMetrics,
    pub invalid_samples: InvalidSamples,
    /// Set when the stored baseline was missing or unreadable and an empty one was used.
    pub baseline_note: Option<String>,
}

pub struct BaselineWorkflow {
    files: Arc<dyn FileStore>,
    bucket: String,
    key: String,
    profile: ColumnProfile,
    max_upload_bytes: usize,
}

impl BaselineWorkflow {
    pub fn new(
        files: Arc<dyn FileStore>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        profile: ColumnProfile,
        max_upload_bytes: usize,
    ) -> Self {
        Self {
            files,
            bucket: bucket.into(),
            key: key.into(),
            profile,
            max_upload_bytes,
        }
    }

    pub fn from_config(
        config: &ReconConfig,
        profile: ColumnProfile,
        files: Arc<dyn FileStore>,
    ) -> Self {
        Self::new(
            files,
            config.ge_bucket.clone(),
            config.ge_latest_key.clone(),
            profile,
            config.max_upload_bytes,
        )
    }

    /// Survey workbooks only. The first sheet carrying every required column is
    /// used; without one, the first sheet is normalized so the schema error names
    /// what is missing.
    fn load_survey(&self, file_name: Option<&str>, bytes: &[u8]) -> Result<Normalized, PipelineError> {
        let name = file_name.unwrap_or("upload");
        if bytes.len() > self.max_upload_bytes {
            return Err(IngestError::TooLarge {
                name: name.to_string(),
                size: bytes.len(),
                limit: self.max_upload_bytes,
            }
            .into());
        }
        if SpreadsheetKind::detect(file_name, bytes)? != SpreadsheetKind::Workbook {
            return Err(IngestError::UnsupportedType(name.to_string()).into());
        }

        let spec = NormalizeSpec::survey(&self.profile);
        let table: RawTable = match find_sheet_with_columns(bytes, &spec.required_refs())? {
            Some(table) => table,
            None => read_workbook(bytes)?,
        };
        Ok(normalize(&table, &spec)?)
    }

    fn overlay_fields(&self) -> [&str; 3] {
        self.profile.overlay.all()
    }

    pub async fn compare(
        &self,
        file_name: Option<&str>,
        bytes: &[u8],
        auto_replace: bool,
    ) -> Result<BaselineComparison, PipelineError> {
        let fresh = self.load_survey(file_name, bytes)?;

        let stored = self
            .files
            .download(&self.bucket, &self.key)
            .instrument(info_span!("stage", stage = %Stage::BaselineFetch))
            .await
            .map_err(|source| stage_error(Stage::BaselineFetch, source))?;

        let (baseline, baseline_metrics, baseline_note) = match stored {
            None => (
                Snapshot::empty(),
                NormalizeMetrics::default(),
                Some(format!("no baseline at {}/{}", self.bucket, self.key)),
            ),
            Some(stored) => match self.load_survey(Some(&self.key), &stored) {
                Ok(normalized) => (normalized.snapshot, normalized.metrics, None),
                Err(err) => {
                    warn!(error = %err, "stored baseline unreadable, comparing against empty");
                    (
                        Snapshot::empty(),
                        NormalizeMetrics::default(),
                        Some(format!("stored baseline unreadable: {err}")),
                    )
                }
            },
        };

        let summary = diff_snapshots(&fresh.snapshot, &baseline, &self.overlay_fields());
        let replace_baseline = should_replace_baseline(&summary);
        info!(
            added = summary.added_count(),
            modified = summary.modified_count(),
            unchanged = summary.unchanged_count(),
            replace_baseline,
            "baseline compared"
        );

        let mut replaced = false;
        if auto_replace && replace_baseline {
            self.files
                .upload(&self.bucket, &self.key, bytes, true)
                .instrument(info_span!("stage", stage = %Stage::BaselineUpload))
                .await
                .map_err(|source| stage_error(Stage::BaselineUpload, source))?;
            replaced = true;
            info!(bucket = %self.bucket, key = %self.key, "baseline replaced");
        }

        Ok(BaselineComparison {
            summary,
            replace_baseline,
            replaced,
            new_metrics: fresh.metrics,
            baseline_metrics,
            invalid_samples: fresh.invalid_samples,
            baseline_note,
        })
    }

    /// Signed download URL for the current baseline; `None` when there is none.
    pub async fn link(&self, ttl_seconds: u64) -> Result<Option<String>, PipelineError> {
        self.files
            .signed_url(&self.bucket, &self.key, ttl_seconds)
            .instrument(info_span!("stage", stage = %Stage::BaselineLink))
            .await
            .map_err(|source| stage_error(Stage::BaselineLink, source))
    }
}

fn stage_error(stage: Stage, source: recon_storage::StoreError) -> PipelineError {
    warn!(stage = %stage, error = %source, "stage failed");
    PipelineError::Stage {
        stage,
        partial: Box::default(),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use recon_storage::{MemoryFileStore, UnconfiguredStore};
    use rust_xlsxwriter::Workbook;

    const HEADERS: [&str; 4] = [
        "Id",
        "Has Fence on Google Earth",
        "Google Earth Last Picture At",
        "Google Earth Last Checked At",
    ];

    fn workbook(rows: &[[&str; 4]]) -> Vec<u8> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        for (c, h) in HEADERS.iter().enumerate() {
            sheet.write_string(0, c as u16, *h).unwrap();
        }
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                sheet.write_string((r + 1) as u32, c as u16, *v).unwrap();
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    fn workflow(files: Arc<MemoryFileStore>) -> BaselineWorkflow {
        BaselineWorkflow::new(
            files,
            "google_earth_files",
            "current/latest.xlsx",
            ColumnProfile::default(),
            5 * 1024 * 1024,
        )
    }

    #[tokio::test]
    async fn first_run_adds_everything_and_replaces() {
        let files = Arc::new(MemoryFileStore::new());
        let bytes = workbook(&[["1", "Y", "01/02/2024", ""], ["2", "no", "45000", "bogus"]]);

        let result = workflow(files.clone())
            .compare(Some("survey.xlsx"), &bytes, true)
            .await
            .unwrap();

        assert_eq!(result.summary.added_count(), 2);
        assert_eq!(result.summary.modified_count(), 0);
        assert!(result.replace_baseline);
        assert!(result.replaced);
        assert!(result.baseline_note.is_some());
        assert_eq!(result.new_metrics.invalid_dates.get("Google Earth Last Checked At"), Some(&1));
        assert_eq!(
            files.object("google_earth_files", "current/latest.xlsx"),
            Some(bytes)
        );
    }

    #[tokio::test]
    async fn identical_file_keeps_the_baseline() {
        let files = Arc::new(MemoryFileStore::new());
        let stored = workbook(&[["1", "Yes", "2024-01-02", ""]]);
        files
            .upload("google_earth_files", "current/latest.xlsx", &stored, true)
            .await
            .unwrap();

        // Same values in different spellings normalize to the same tuple.
        let fresh = workbook(&[["1.0", "y", "01/02/2024", "-"]]);
        let result = workflow(files.clone())
            .compare(Some("survey.xlsx"), &fresh, true)
            .await
            .unwrap();

        assert_eq!(result.summary.unchanged_count(), 1);
        assert!(!result.replace_baseline);
        assert!(!result.replaced);
        assert_eq!(
            files.object("google_earth_files", "current/latest.xlsx"),
            Some(stored)
        );
    }

    #[tokio::test]
    async fn modified_row_without_auto_replace_is_reported_only() {
        let files = Arc::new(MemoryFileStore::new());
        let stored = workbook(&[["1", "Yes", "", ""], ["2", "No", "", ""]]);
        files
            .upload("google_earth_files", "current/latest.xlsx", &stored, true)
            .await
            .unwrap();

        let fresh = workbook(&[["1", "No", "", ""], ["2", "No", "", ""]]);
        let result = workflow(files.clone())
            .compare(Some("survey.xlsx"), &fresh, false)
            .await
            .unwrap();

        assert_eq!(result.summary.modified, vec!["1"]);
        assert!(result.replace_baseline);
        assert!(!result.replaced);
        assert_eq!(result.baseline_metrics.rows_after_id_filter, 2);
    }

    #[tokio::test]
    async fn missing_columns_and_csv_uploads_are_rejected() {
        let files = Arc::new(MemoryFileStore::new());
        let mut workbook = Workbook::new();
        workbook
            .add_worksheet()
            .write_string(0, 0, "Id")
            .unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let err = workflow(files.clone())
            .compare(Some("survey.xlsx"), &bytes, true)
            .await
            .unwrap_err();
        match err {
            PipelineError::Schema(schema) => assert_eq!(schema.missing.len(), 3),
            other => panic!("unexpected error: {other}"),
        }

        let err = workflow(files)
            .compare(Some("survey.csv"), b"Id\n1\n", true)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Ingest(IngestError::UnsupportedType(_))));
    }

    #[tokio::test]
    async fn link_reports_missing_baseline_and_store_failures() {
        let files = Arc::new(MemoryFileStore::new());
        assert_eq!(workflow(files.clone()).link(DEFAULT_LINK_TTL_SECS).await.unwrap(), None);

        files
            .upload("google_earth_files", "current/latest.xlsx", b"x", true)
            .await
            .unwrap();
        let url = workflow(files).link(DEFAULT_LINK_TTL_SECS).await.unwrap().unwrap();
        assert!(url.starts_with("memory://"));

        let offline = BaselineWorkflow::new(
            Arc::new(UnconfiguredStore),
            "b",
            "k",
            ColumnProfile::default(),
            1024,
        );
        let err = offline.link(60).await.unwrap_err();
        assert!(matches!(err, PipelineError::Stage { stage: Stage::BaselineLink, .. }));
    }
}
