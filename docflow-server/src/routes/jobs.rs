use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use docflow::store::{FileType, JobListQuery, JobStatus, SortField, SortOrder};
use docflow::{JobHistory, JobStatusView, Submission};

use super::blocking;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SubmitRequest {
    pub file_name: String,
    #[serde(default)]
    pub file_type: Option<FileType>,
    #[serde(alias = "llm_model")]
    pub model_id: String,
    /// Base64-encoded page images, in page order.
    pub pages: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub job_id: String,
    pub status: JobStatus,
    pub total_pages: usize,
}

/// POST /jobs
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<(StatusCode, Json<SubmitResponse>)> {
    let pages = request
        .pages
        .iter()
        .enumerate()
        .map(|(i, page)| {
            BASE64
                .decode(page.trim())
                .map_err(|e| ApiError::BadRequest(format!("invalid pages[{}]: {}", i, e)))
        })
        .collect::<ApiResult<Vec<_>>>()?;
    let total_pages = pages.len();

    let submission = Submission {
        file_name: request.file_name,
        file_type: request.file_type,
        model_id: request.model_id,
        pages,
    };

    let submitter = state.submitter();
    let job_id = blocking(move || Ok(submitter.submit(submission)?)).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Processing,
            total_pages,
        }),
    ))
}

/// GET /jobs/:job_id/status
pub async fn job_status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobStatusView>> {
    let status = state.status();
    let view = blocking(move || Ok(status.get_status(&job_id)?)).await?;
    Ok(Json(view))
}

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    #[serde(default)]
    pub sort_by: Option<SortField>,
    #[serde(default)]
    pub order: Option<SortOrder>,
    #[serde(default)]
    pub status: Option<JobStatus>,
    #[serde(default)]
    pub limit: Option<u64>,
    #[serde(default)]
    pub offset: Option<u64>,
}

impl From<HistoryParams> for JobListQuery {
    fn from(params: HistoryParams) -> Self {
        Self {
            sort_by: params.sort_by.unwrap_or_default(),
            order: params.order.unwrap_or_default(),
            status: params.status,
            limit: params.limit,
            offset: params.offset,
        }
    }
}

/// GET /jobs
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<JobHistory>> {
    let status = state.status();
    let query = JobListQuery::from(params);
    let history = blocking(move || Ok(status.history(&query)?)).await?;
    Ok(Json(history))
}

/// DELETE /jobs/:job_id
pub async fn delete_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let status = state.status();
    blocking(move || Ok(status.delete_job(&job_id)?)).await?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// DELETE /jobs
pub async fn delete_all_jobs(State(state): State<AppState>) -> ApiResult<Json<serde_json::Value>> {
    let status = state.status();
    let deleted = blocking(move || Ok(status.delete_all()?)).await?;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}
