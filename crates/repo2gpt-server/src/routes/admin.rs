//! Health and persisted-log endpoints.

use axum::extract::{Query, State};
use axum::Json;
use repo2gpt_telemetry::{LogQuery, LogRecord};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::server::AppState;

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub uptime_secs: u64,
    pub active_jobs: usize,
}

/// GET /healthz
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        active_jobs: state.runner.active_jobs(),
    })
}

/// GET /admin/logs
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<LogRecord>>, ApiError> {
    let sink = state
        .logs
        .as_ref()
        .ok_or_else(|| ApiError::NotFound("log persistence is disabled".into()))?;
    let records = sink
        .query(&query)
        .map_err(|e| ApiError::Internal(format!("log query failed: {e}")))?;
    Ok(Json(records))
}
