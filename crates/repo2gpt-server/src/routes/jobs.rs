//! Submission, inspection, artifacts, polling and cancel.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use repo2gpt_core::events::JobEvent;
use repo2gpt_core::ids::JobId;
use repo2gpt_core::job::{Chunk, Job, JobArtifacts, JobRequest, JobStatus, TokenEstimatorInfo, TokenTotals};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::ApiError;
use crate::server::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;
const MAX_LIST_LIMIT: u32 = 500;

#[derive(Debug, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: JobId,
    pub status: JobStatus,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&Job> for JobSummary {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id.clone(),
            status: job.status,
            created_at: job.created_at.clone(),
            updated_at: job.updated_at.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub job: Job,
    pub events: Vec<JobEvent>,
}

#[derive(Debug, Serialize)]
pub struct ChunkView {
    pub index: usize,
    pub token_count: u64,
    pub file_count: usize,
    pub files: Vec<String>,
    pub content: String,
}

impl From<Chunk> for ChunkView {
    fn from(chunk: Chunk) -> Self {
        Self {
            index: chunk.index,
            token_count: chunk.token_count,
            file_count: chunk.file_count(),
            files: chunk.files,
            content: chunk.content,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ArtifactsView {
    pub repomap: String,
    pub chunks: Vec<ChunkView>,
    pub warnings: Vec<String>,
    pub token_estimator: TokenEstimatorInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_totals: Option<TokenTotals>,
}

impl From<JobArtifacts> for ArtifactsView {
    fn from(a: JobArtifacts) -> Self {
        Self {
            repomap: a.repomap,
            chunks: a.chunks.into_iter().map(ChunkView::from).collect(),
            warnings: a.warnings,
            token_estimator: a.token_estimator,
            token_totals: a.token_totals,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AfterParams {
    pub after: Option<u64>,
}

/// POST /jobs
pub async fn create_job(
    State(state): State<AppState>,
    payload: Result<Json<JobRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<JobSummary>), ApiError> {
    let Json(request) = payload.map_err(|e| match e.status() {
        StatusCode::PAYLOAD_TOO_LARGE => ApiError::PayloadTooLarge(e.body_text()),
        _ => ApiError::Unprocessable(e.body_text()),
    })?;
    let job = state.runner.submit(request)?;
    info!(job_id = %job.id, "job submitted");
    Ok((StatusCode::ACCEPTED, Json(JobSummary::from(&job))))
}

/// GET /jobs?limit=N
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<JobSummary>>, ApiError> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .clamp(1, MAX_LIST_LIMIT);
    let jobs = state.store.list_jobs(limit)?;
    Ok(Json(jobs.iter().map(JobSummary::from).collect()))
}

/// GET /jobs/{id}
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobDetail>, ApiError> {
    let id = JobId::from_raw(id);
    let job = state.store.get_job(&id)?;
    let events = state.store.events(&id)?;
    Ok(Json(JobDetail { job, events }))
}

/// GET /jobs/{id}/artifacts
pub async fn get_artifacts(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ArtifactsView>, ApiError> {
    let artifacts = state.store.artifacts(&JobId::from_raw(id))?;
    Ok(Json(artifacts.into()))
}

/// GET /jobs/{id}/history?after=N
pub async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<AfterParams>,
) -> Result<Json<Vec<JobEvent>>, ApiError> {
    let events = state
        .subscriptions
        .poll(&JobId::from_raw(id), params.after.unwrap_or(0))?;
    Ok(Json(events))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub id: JobId,
    /// `false` when the job had already finished.
    pub cancel_requested: bool,
}

/// POST /jobs/{id}/cancel
pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    let id = JobId::from_raw(id);
    let cancel_requested = state.runner.cancel(&id)?;
    Ok(Json(CancelResponse {
        id,
        cancel_requested,
    }))
}
