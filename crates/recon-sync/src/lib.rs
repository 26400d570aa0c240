//! Leads reconciliation pipeline and geospatial baseline workflow.

use std::fmt;

use recon_core::SchemaError;
use recon_ingest::IngestError;
use recon_storage::StoreError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod baseline;
pub mod cleanup;
pub mod config;
pub mod diff;
pub mod enrich;
pub mod identity;
pub mod normalize;
pub mod overlay;
pub mod pipeline;
pub mod remote;
pub mod reports;

pub use baseline::{BaselineComparison, BaselineWorkflow};
pub use config::ReconConfig;
pub use diff::{diff_snapshots, should_replace_baseline, DiffSummary};
pub use pipeline::{LeadsOptions, LeadsPipeline, LeadsReport, RunMetrics, RunSummary, UploadedFile};
pub use reports::{acknowledge_run, list_runs, load_run, read_export, write_run_artifacts, ExportFormat};

pub const CRATE_NAME: &str = "recon-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Normalize,
    Cleanup,
    Enrich,
    RemoteMerge,
    Overlay,
    Diff,
    Export,
    Acknowledge,
    BaselineFetch,
    BaselineUpload,
    BaselineLink,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normalize => "normalize",
            Self::Cleanup => "cleanup",
            Self::Enrich => "enrich",
            Self::RemoteMerge => "remote_merge",
            Self::Overlay => "overlay",
            Self::Diff => "diff",
            Self::Export => "export",
            Self::Acknowledge => "acknowledge",
            Self::BaselineFetch => "baseline_fetch",
            Self::BaselineUpload => "baseline_upload",
            Self::BaselineLink => "baseline_link",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    /// An external call failed for good. `partial` holds the metrics computed
    /// before the failing stage.
    #[error("{stage} stage failed: {source}")]
    Stage {
        stage: Stage,
        partial: Box<RunMetrics>,
        #[source]
        source: StoreError,
    },
}

impl PipelineError {
    pub fn partial(&self) -> Option<&RunMetrics> {
        match self {
            Self::Stage { partial, .. } => Some(partial),
            _ => None,
        }
    }
}
