//! Leads pipeline orchestration: load → normalize → cleanup → enrich → remote merge
//! → overlay → diff → export.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use recon_core::{ColumnProfile, Snapshot};
use recon_ingest::{load_table, normalize_column_names, write_csv, write_xlsx};
use recon_storage::{DataStore, FileStore, StoreError};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::cleanup::{clean_leads, CleanupReport};
use crate::config::ReconConfig;
use crate::diff::{diff_snapshots, DiffSummary};
use crate::enrich::{enrich, EnrichmentStats};
use crate::normalize::{normalize, InvalidSamples, NormalizeMetrics, NormalizeSpec, Normalized};
use crate::overlay::{overlay_from_store, OverlayStats};
use crate::remote::{fetch_and_merge, MergeStats, UnmatchedRecordWarning};
use crate::{PipelineError, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub name: Option<String>,
    pub bytes: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: Some(name.into()),
            bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeadsOptions {
    pub skip_remote: bool,
    pub skip_overlay: bool,
}

/// Per-stage metrics accumulated during one run. Returned with the report, and
/// with a stage failure as the partial result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub current: Option<NormalizeMetrics>,
    pub previous: Option<NormalizeMetrics>,
    pub previous_skipped: Option<String>,
    pub cleanup: Option<CleanupReport>,
    pub enrichment: Option<EnrichmentStats>,
    pub remote: Option<MergeStats>,
    pub overlay: Option<OverlayStats>,
    pub stage_millis: BTreeMap<String, u64>,
}

/// Everything about a run except the export bytes; written as `summary.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub business_date: NaiveDate,
    pub current_file: Option<String>,
    pub previous_file: Option<String>,
    pub record_count: usize,
    pub added: usize,
    pub modified: usize,
    pub unchanged: usize,
    pub diff: DiffSummary,
    pub invalid_samples: InvalidSamples,
    pub processed_update_ids: Vec<String>,
    pub unmatched_samples: Vec<UnmatchedRecordWarning>,
    pub metrics: RunMetrics,
    pub csv_file_name: String,
    pub xlsx_file_name: String,
}

#[derive(Debug, Clone)]
pub struct LeadsReport {
    pub summary: RunSummary,
    pub snapshot: Snapshot,
    pub final_csv: Vec<u8>,
    pub final_xlsx: Vec<u8>,
}

/// Explicit state for one run; never shared across runs.
struct RunState {
    run_id: Uuid,
    started_at: DateTime<Utc>,
    metrics: RunMetrics,
}

impl RunState {
    fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            metrics: RunMetrics::default(),
        }
    }

    fn finish_stage(&mut self, stage: Stage, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(stage = %stage, elapsed_ms, "stage complete");
        self.metrics
            .stage_millis
            .insert(stage.as_str().to_string(), elapsed_ms);
    }

    fn fail(&self, stage: Stage, source: StoreError) -> PipelineError {
        warn!(stage = %stage, error = %source, "stage failed");
        PipelineError::Stage {
            stage,
            partial: Box::new(self.metrics.clone()),
            source,
        }
    }
}

pub struct LeadsPipeline {
    config: ReconConfig,
    profile: ColumnProfile,
    data_store: Arc<dyn DataStore>,
    file_store: Arc<dyn FileStore>,
}

impl LeadsPipeline {
    pub fn new(
        config: ReconConfig,
        profile: ColumnProfile,
        data_store: Arc<dyn DataStore>,
        file_store: Arc<dyn FileStore>,
    ) -> Self {
        Self {
            config,
            profile,
            data_store,
            file_store,
        }
    }

    pub fn from_config(config: ReconConfig) -> Result<Self> {
        let profile = config.load_profile()?;
        let data_store = config.data_store(&profile)?;
        let file_store = config.file_store()?;
        Ok(Self::new(config, profile, data_store, file_store))
    }

    pub fn config(&self) -> &ReconConfig {
        &self.config
    }

    pub fn profile(&self) -> &ColumnProfile {
        &self.profile
    }

    pub fn file_store(&self) -> Arc<dyn FileStore> {
        self.file_store.clone()
    }

    fn load(&self, file: &UploadedFile) -> Result<Normalized, PipelineError> {
        let table = load_table(file.name.as_deref(), &file.bytes, self.config.max_upload_bytes)?;
        let table = normalize_column_names(table, &self.profile.aliases);
        Ok(normalize(&table, &NormalizeSpec::leads(&self.profile))?)
    }

    /// The previous file is optional; any failure to read it drops back-fill for
    /// this run instead of failing it.
    fn load_previous(&self, file: &UploadedFile, state: &mut RunState) -> Option<Snapshot> {
        match self.load(file) {
            Ok(previous) => {
                state.metrics.previous = Some(previous.metrics);
                let skip = self.cleanup_skip_columns();
                let (cleaned, _) = clean_leads(&previous.snapshot, &self.profile.cleanup, &skip);
                Some(cleaned)
            }
            Err(err) => {
                warn!(error = %err, "previous file ignored");
                state.metrics.previous_skipped = Some(err.to_string());
                None
            }
        }
    }

    fn cleanup_skip_columns(&self) -> Vec<&str> {
        vec![
            self.profile.identifier_column.as_str(),
            self.profile.email_column.as_str(),
        ]
    }

    fn tracked_columns(&self) -> Vec<&str> {
        self.profile.tracked_columns()
    }

    pub async fn run(
        &self,
        current: &UploadedFile,
        previous: Option<&UploadedFile>,
        options: LeadsOptions,
    ) -> Result<LeadsReport, PipelineError> {
        let mut state = RunState::new();
        let span = info_span!("leads_run", run_id = %state.run_id);

        async move {
            info!(
                current = current.name.as_deref().unwrap_or("upload"),
                previous = previous.and_then(|p| p.name.as_deref()),
                "leads run started"
            );

            let started = Instant::now();
            let current_norm = info_span!("stage", stage = %Stage::Normalize)
                .in_scope(|| self.load(current))?;
            state.metrics.current = Some(current_norm.metrics.clone());
            let previous_snapshot = previous.and_then(|file| self.load_previous(file, &mut state));
            state.finish_stage(Stage::Normalize, started);

            let started = Instant::now();
            let skip = self.cleanup_skip_columns();
            let (cleaned, cleanup) = info_span!("stage", stage = %Stage::Cleanup)
                .in_scope(|| clean_leads(&current_norm.snapshot, &self.profile.cleanup, &skip));
            state.metrics.cleanup = Some(cleanup);
            state.finish_stage(Stage::Cleanup, started);

            let started = Instant::now();
            let (enriched, enrichment) = info_span!("stage", stage = %Stage::Enrich)
                .in_scope(|| enrich(&cleaned, previous_snapshot.as_ref(), &self.profile));
            state.metrics.enrichment = Some(enrichment);
            state.finish_stage(Stage::Enrich, started);

            let mut processed_update_ids = Vec::new();
            let mut unmatched_samples = Vec::new();
            let merged = if options.skip_remote {
                info!("remote merge skipped");
                enriched
            } else {
                let started = Instant::now();
                let outcome = fetch_and_merge(self.data_store.as_ref(), &enriched, &self.profile)
                    .instrument(info_span!("stage", stage = %Stage::RemoteMerge))
                    .await
                    .map_err(|e| state.fail(Stage::RemoteMerge, e))?;
                state.metrics.remote = Some(outcome.stats);
                processed_update_ids = outcome.processed_ids;
                unmatched_samples = outcome.unmatched_samples;
                state.finish_stage(Stage::RemoteMerge, started);
                outcome.snapshot
            };

            let finalized = if options.skip_overlay {
                info!("overlay skipped");
                merged
            } else {
                let started = Instant::now();
                let result = overlay_from_store(
                    self.file_store.as_ref(),
                    &self.config.ge_bucket,
                    &self.config.ge_latest_key,
                    &merged,
                    &self.profile,
                )
                .instrument(info_span!("stage", stage = %Stage::Overlay))
                .await
                .map_err(|e| state.fail(Stage::Overlay, e))?;
                state.metrics.overlay = Some(result.stats);
                state.finish_stage(Stage::Overlay, started);
                result.snapshot
            };

            let started = Instant::now();
            let tracked = self.tracked_columns();
            // Defaults applied to both sides so a column missing from the previous
            // file does not count as a change.
            let baseline = previous_snapshot
                .as_ref()
                .map(|prev| enrich(prev, None, &self.profile).0)
                .unwrap_or_default();
            let diff = diff_snapshots(&finalized, &baseline, &tracked);
            state.finish_stage(Stage::Diff, started);

            let started = Instant::now();
            let final_csv = write_csv(&finalized)?;
            let final_xlsx = write_xlsx(&finalized)?;
            state.finish_stage(Stage::Export, started);

            let business_date = self.config.business_today();
            let stamp = business_date.format("%Y-%m-%d");
            let summary = RunSummary {
                run_id: state.run_id,
                started_at: state.started_at,
                finished_at: Utc::now(),
                business_date,
                current_file: current.name.clone(),
                previous_file: previous.and_then(|p| p.name.clone()),
                record_count: finalized.len(),
                added: diff.added_count(),
                modified: diff.modified_count(),
                unchanged: diff.unchanged_count(),
                diff,
                invalid_samples: current_norm.invalid_samples,
                processed_update_ids,
                unmatched_samples,
                metrics: state.metrics,
                csv_file_name: format!("final_file_{stamp}.csv"),
                xlsx_file_name: format!("final_file_{stamp}.xlsx"),
            };

            info!(
                records = summary.record_count,
                added = summary.added,
                modified = summary.modified,
                unchanged = summary.unchanged,
                processed_updates = summary.processed_update_ids.len(),
                "leads run finished"
            );

            Ok(LeadsReport {
                summary,
                snapshot: finalized,
                final_csv,
                final_xlsx,
            })
        }
        .instrument(span)
        .await
    }

    /// Marks the given update ids applied with today's business date.
    pub async fn acknowledge(&self, update_ids: &[String]) -> Result<usize, PipelineError> {
        if update_ids.is_empty() {
            info!("nothing to acknowledge");
            return Ok(0);
        }
        let applied_on = self.config.business_today();
        self.data_store
            .mark_applied(update_ids, applied_on)
            .instrument(info_span!("stage", stage = %Stage::Acknowledge))
            .await
            .map_err(|source| {
                warn!(error = %source, "acknowledge failed");
                PipelineError::Stage {
                    stage: Stage::Acknowledge,
                    partial: Box::default(),
                    source,
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use recon_core::PendingUpdate;
    use recon_storage::{MemoryDataStore, MemoryFileStore};
    use rust_xlsxwriter::Workbook;

    struct FailingDataStore;

    #[async_trait]
    impl DataStore for FailingDataStore {
        async fn fetch_pending_updates(&self) -> Result<Vec<PendingUpdate>, StoreError> {
            Err(StoreError::RetriesExhausted {
                operation: "fetch_pending_updates".into(),
                attempts: 4,
                last_error: "http status 503".into(),
            })
        }

        async fn mark_applied(
            &self,
            _update_ids: &[String],
            _applied_on: NaiveDate,
        ) -> Result<usize, StoreError> {
            Err(StoreError::MissingCredentials)
        }
    }

    const CURRENT_CSV: &str = "Id,Email,ZipCode,LeadStatus,CellPhoneNumber\n\
        1024,ana@example.com,7030,Open,5551234567\n\
        2048,bo@example.com,02139,Won,\n\
        ,nobody@example.com,1,Open,\n";

    const PREVIOUS_CSV: &str = "Id,Email,Has Fence on Google Earth,ZipCode,LeadStatus,Asked For No Contact\n\
        1024,ana@example.com,No,07030,Open,Yes\n";

    fn survey_bytes() -> Vec<u8> {
        let mut workbook = Workbook::new();
        let sheet = workbook.add_worksheet();
        let rows = [
            [
                "Id",
                "Has Fence on Google Earth",
                "Google Earth Last Picture At",
                "Google Earth Last Checked At",
            ],
            ["2048", "Yes", "2024-05-01", ""],
        ];
        for (r, row) in rows.iter().enumerate() {
            for (c, v) in row.iter().enumerate() {
                sheet.write_string(r as u32, c as u16, *v).unwrap();
            }
        }
        workbook.save_to_buffer().unwrap()
    }

    fn pipeline(data: Arc<dyn DataStore>, files: Arc<dyn FileStore>) -> LeadsPipeline {
        LeadsPipeline::new(ReconConfig::default(), ColumnProfile::default(), data, files)
    }

    #[tokio::test]
    async fn full_run_merges_every_source() {
        let updates: Vec<PendingUpdate> = serde_json::from_str(
            r#"[{"id": "u1", "lead": "2048", "asked_for_no_contact": "Yes"},
                {"id": "u2", "lead": "9999", "eligible_for_emails": "No"}]"#,
        )
        .unwrap();
        let files = Arc::new(MemoryFileStore::new());
        files
            .upload("google_earth_files", "current/latest.xlsx", &survey_bytes(), true)
            .await
            .unwrap();
        let pipeline = pipeline(Arc::new(MemoryDataStore::new(updates)), files);

        let report = pipeline
            .run(
                &UploadedFile::new("leads.csv", CURRENT_CSV.as_bytes().to_vec()),
                Some(&UploadedFile::new("previous.csv", PREVIOUS_CSV.as_bytes().to_vec())),
                LeadsOptions::default(),
            )
            .await
            .unwrap();

        let summary = &report.summary;
        assert_eq!(summary.record_count, 2);
        assert_eq!(summary.processed_update_ids, vec!["u1"]);
        assert_eq!(summary.added, 1);
        assert_eq!(summary.modified, 0);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.metrics.current.as_ref().unwrap().discarded_empty_id, 1);
        assert_eq!(summary.metrics.remote.as_ref().unwrap().unmatched_not_found, 1);
        assert!(summary.csv_file_name.starts_with("final_file_"));

        let ana = report.snapshot.find("1024").unwrap();
        assert_eq!(ana.text("Asked For No Contact"), "Yes");
        assert_eq!(ana.text("Has Fence on Google Earth"), "No");
        assert_eq!(ana.text("ZipCode"), "07030");
        assert_eq!(ana.text("CellPhoneNumber"), "(555) 123-4567");

        let bo = report.snapshot.find("2048").unwrap();
        assert_eq!(bo.text("Asked For No Contact"), "Yes");
        assert_eq!(bo.text("Has Fence on Google Earth"), "Yes");
        assert_eq!(bo.text("Google Earth Last Picture At"), "05/01/2024");
        assert_eq!(bo.text("Eligible for Emails"), "Yes");

        let csv_text = String::from_utf8(report.final_csv.clone()).unwrap();
        assert!(csv_text.starts_with("Id,Email,Has Fence on Google Earth,"));
        assert!(!report.final_xlsx.is_empty());
    }

    #[tokio::test]
    async fn exported_csv_normalizes_to_the_same_records() {
        let pipeline = pipeline(
            Arc::new(MemoryDataStore::default()),
            Arc::new(MemoryFileStore::new()),
        );
        let report = pipeline
            .run(
                &UploadedFile::new("leads.csv", CURRENT_CSV.as_bytes().to_vec()),
                Some(&UploadedFile::new("previous.csv", PREVIOUS_CSV.as_bytes().to_vec())),
                LeadsOptions {
                    skip_remote: true,
                    skip_overlay: true,
                },
            )
            .await
            .unwrap();

        let reimported = pipeline
            .load(&UploadedFile::new("final.csv", report.final_csv.clone()))
            .unwrap()
            .snapshot;
        let ids: Vec<&str> = reimported.identifiers().collect();
        assert_eq!(ids, report.snapshot.identifiers().collect::<Vec<_>>());
        for column in pipeline.tracked_columns() {
            for record in report.snapshot.records() {
                assert_eq!(
                    reimported.find(&record.identifier).unwrap().text(column),
                    record.text(column)
                );
            }
        }
    }

    #[tokio::test]
    async fn schema_error_aborts_before_external_calls() {
        let pipeline = pipeline(Arc::new(FailingDataStore), Arc::new(MemoryFileStore::new()));
        let err = pipeline
            .run(
                &UploadedFile::new("leads.csv", b"Email\nana@example.com\n".to_vec()),
                None,
                LeadsOptions::default(),
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::Schema(schema) => assert_eq!(schema.missing, vec!["Id"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn remote_failure_keeps_partial_metrics() {
        let pipeline = pipeline(Arc::new(FailingDataStore), Arc::new(MemoryFileStore::new()));
        let err = pipeline
            .run(
                &UploadedFile::new("leads.csv", CURRENT_CSV.as_bytes().to_vec()),
                None,
                LeadsOptions::default(),
            )
            .await
            .unwrap_err();

        let partial = err.partial().unwrap();
        assert!(matches!(err, PipelineError::Stage { stage: Stage::RemoteMerge, .. }));
        assert_eq!(partial.current.as_ref().unwrap().rows_after_id_filter, 2);
        assert!(partial.enrichment.is_some());
        assert!(partial.remote.is_none());
    }

    #[tokio::test]
    async fn unreadable_previous_file_is_skipped() {
        let pipeline = pipeline(
            Arc::new(MemoryDataStore::default()),
            Arc::new(MemoryFileStore::new()),
        );
        let report = pipeline
            .run(
                &UploadedFile::new("leads.csv", CURRENT_CSV.as_bytes().to_vec()),
                Some(&UploadedFile::new("previous.pdf", b"%PDF-1.4".to_vec())),
                LeadsOptions {
                    skip_remote: true,
                    skip_overlay: true,
                },
            )
            .await
            .unwrap();
        assert!(report.summary.metrics.previous_skipped.is_some());
        assert_eq!(report.summary.added, 2);
        assert!(report.summary.metrics.overlay.is_none());
    }

    #[tokio::test]
    async fn lead_overlay_columns_fold_flags_and_sample_bad_dates() {
        let pipeline = pipeline(
            Arc::new(MemoryDataStore::default()),
            Arc::new(MemoryFileStore::new()),
        );
        let csv = "Id,Has Fence on Google Earth,Google Earth Last Picture At,ZipCode,LeadStatus\n\
            1,y,garbage,07030,Open\n\
            2,TRUE,45292,07030,Open\n";
        let report = pipeline
            .run(
                &UploadedFile::new("leads.csv", csv.as_bytes().to_vec()),
                None,
                LeadsOptions {
                    skip_remote: true,
                    skip_overlay: true,
                },
            )
            .await
            .unwrap();

        let samples = &report.summary.invalid_samples["Google Earth Last Picture At"];
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].identifier, "1");
        assert_eq!(samples[0].raw_value, "garbage");

        let first = report.snapshot.find("1").unwrap();
        assert_eq!(first.text("Has Fence on Google Earth"), "Yes");
        assert_eq!(first.text("Google Earth Last Picture At"), "");
        let second = report.snapshot.find("2").unwrap();
        assert_eq!(second.text("Has Fence on Google Earth"), "Yes");
        assert_eq!(second.text("Google Earth Last Picture At"), "01/01/2024");
    }

    #[tokio::test]
    async fn acknowledging_nothing_makes_no_call() {
        let pipeline = pipeline(Arc::new(FailingDataStore), Arc::new(MemoryFileStore::new()));
        assert_eq!(pipeline.acknowledge(&[]).await.unwrap(), 0);
        assert!(pipeline.acknowledge(&["u1".to_string()]).await.is_err());
    }
}
