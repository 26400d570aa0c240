//! Axum JSON / multipart surface over the leads pipeline and the baseline workflow.

use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use recon_sync::baseline::DEFAULT_LINK_TTL_SECS;
use recon_sync::{
    acknowledge_run, list_runs, read_export, write_run_artifacts, BaselineWorkflow, ExportFormat,
    LeadsOptions, LeadsPipeline, PipelineError, ReconConfig, UploadedFile,
};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "recon-web";

/// Room for two uploads plus multipart framing.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<LeadsPipeline>,
    pub baseline: Arc<BaselineWorkflow>,
    pub reports_dir: PathBuf,
}

impl AppState {
    pub fn new(pipeline: LeadsPipeline, baseline: BaselineWorkflow, reports_dir: impl Into<PathBuf>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            baseline: Arc::new(baseline),
            reports_dir: reports_dir.into(),
        }
    }

    pub fn from_config(config: ReconConfig) -> anyhow::Result<Self> {
        let reports_dir = config.reports_dir.clone();
        let pipeline = LeadsPipeline::from_config(config)?;
        let baseline = BaselineWorkflow::from_config(
            pipeline.config(),
            pipeline.profile().clone(),
            pipeline.file_store(),
        );
        Ok(Self::new(pipeline, baseline, reports_dir))
    }

    fn body_limit(&self) -> usize {
        self.pipeline.config().max_upload_bytes * 2 + MULTIPART_OVERHEAD
    }
}

#[derive(Debug)]
enum ApiError {
    Pipeline(PipelineError),
    BadRequest(String),
    NotFound(String),
    Internal(anyhow::Error),
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        Self::Pipeline(err)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<PipelineError>() {
            Ok(pipeline) => Self::Pipeline(pipeline),
            Err(other) => Self::Internal(other),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            Self::Pipeline(PipelineError::Schema(schema)) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "error": schema.to_string(), "missing": schema.missing }),
            ),
            Self::Pipeline(PipelineError::Ingest(err)) => (
                StatusCode::BAD_REQUEST,
                json!({ "error": err.to_string() }),
            ),
            Self::Pipeline(err @ PipelineError::Stage { .. }) => {
                error!(error = %err, "external call failed");
                let partial = err.partial().cloned();
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "error": err.to_string(), "partial": partial }),
                )
            }
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, json!({ "error": message })),
            Self::NotFound(message) => (StatusCode::NOT_FOUND, json!({ "error": message })),
            Self::Internal(err) => {
                error!(error = %format!("{err:#}"), "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": format!("{err:#}") }),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

pub fn app(state: AppState) -> Router {
    let limit = state.body_limit();
    Router::new()
        .route("/health", get(health_handler))
        .route("/leads/process", post(process_leads_handler))
        .route("/leads/runs", get(list_runs_handler))
        .route("/leads/runs/{run_id}/final.csv", get(final_csv_handler))
        .route("/leads/runs/{run_id}/final.xlsx", get(final_xlsx_handler))
        .route("/leads/runs/{run_id}/acknowledge", post(acknowledge_handler))
        .route("/baseline/compare", post(baseline_compare_handler))
        .route("/baseline/link", get(baseline_link_handler))
        .layer(DefaultBodyLimit::max(limit))
        .with_state(Arc::new(state))
}

pub async fn serve(config: ReconConfig) -> anyhow::Result<()> {
    let port = config.web_port;
    let state = AppState::from_config(config)?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "recon web listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Collects named file fields from a multipart body.
async fn read_uploads(mut multipart: Multipart, wanted: &[&str]) -> ApiResult<Vec<(String, UploadedFile)>> {
    let mut uploads = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        let Some(name) = field.name().map(str::to_string) else {
            continue;
        };
        if !wanted.contains(&name.as_str()) {
            continue;
        }
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        if bytes.is_empty() {
            continue;
        }
        uploads.push((
            name,
            UploadedFile {
                name: file_name,
                bytes: bytes.to_vec(),
            },
        ));
    }
    Ok(uploads)
}

fn take_upload(uploads: &mut Vec<(String, UploadedFile)>, name: &str) -> Option<UploadedFile> {
    let pos = uploads.iter().position(|(n, _)| n == name)?;
    Some(uploads.remove(pos).1)
}

#[derive(Debug, Deserialize, Default)]
struct ProcessQuery {
    #[serde(default)]
    skip_remote: bool,
    #[serde(default)]
    skip_overlay: bool,
}

async fn process_leads_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProcessQuery>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let mut uploads = read_uploads(multipart, &["current", "previous"]).await?;
    let current = take_upload(&mut uploads, "current")
        .ok_or_else(|| ApiError::BadRequest("multipart field `current` is required".into()))?;
    let previous = take_upload(&mut uploads, "previous");

    let options = LeadsOptions {
        skip_remote: query.skip_remote,
        skip_overlay: query.skip_overlay,
    };
    let report = state.pipeline.run(&current, previous.as_ref(), options).await?;
    write_run_artifacts(&state.reports_dir, &report).await?;
    Ok(Json(report.summary).into_response())
}

#[derive(Debug, Deserialize)]
struct RunsQuery {
    limit: Option<usize>,
}

async fn list_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RunsQuery>,
) -> ApiResult<Response> {
    let runs = list_runs(&state.reports_dir, query.limit.unwrap_or(20)).await?;
    Ok(Json(runs).into_response())
}

fn parse_run_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw).map_err(|_| ApiError::NotFound(format!("unknown run {raw}")))
}

async fn export_response(state: &AppState, raw_id: &str, format: ExportFormat) -> ApiResult<Response> {
    let run_id = parse_run_id(raw_id)?;
    let Some((file_name, bytes)) = read_export(&state.reports_dir, run_id, format).await? else {
        return Err(ApiError::NotFound(format!("unknown run {run_id}")));
    };
    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

async fn final_csv_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> ApiResult<Response> {
    export_response(&state, &run_id, ExportFormat::Csv).await
}

async fn final_xlsx_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(run_id): AxumPath<String>,
) -> ApiResult<Response> {
    export_response(&state, &run_id, ExportFormat::Xlsx).await
}

async fn acknowledge_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(raw_id): AxumPath<String>,
) -> ApiResult<Response> {
    let run_id = parse_run_id(&raw_id)?;
    match acknowledge_run(&state.pipeline, &state.reports_dir, run_id).await? {
        Some(outcome) => Ok(Json(outcome).into_response()),
        None => Err(ApiError::NotFound(format!("unknown run {run_id}"))),
    }
}

#[derive(Debug, Deserialize)]
struct CompareQuery {
    auto_replace: Option<bool>,
}

async fn baseline_compare_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CompareQuery>,
    multipart: Multipart,
) -> ApiResult<Response> {
    let mut uploads = read_uploads(multipart, &["file"]).await?;
    let file = take_upload(&mut uploads, "file")
        .ok_or_else(|| ApiError::BadRequest("multipart field `file` is required".into()))?;
    let auto_replace = query.auto_replace.unwrap_or(true);
    let comparison = state
        .baseline
        .compare(file.name.as_deref(), &file.bytes, auto_replace)
        .await?;
    if comparison.replace_baseline && !comparison.replaced {
        warn!("baseline changed but was not replaced");
    }
    Ok(Json(comparison).into_response())
}

async fn baseline_link_handler(State(state): State<Arc<AppState>>) -> ApiResult<Response> {
    let url = state.baseline.link(DEFAULT_LINK_TTL_SECS).await?;
    Ok(Json(json!({ "url": url })).into_response())
}
