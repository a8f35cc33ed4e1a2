use crate::functions::status;
use crate::schema::{InputRow, Job, JobStatus, RowResult};
use crate::services::{CredentialCipher, JobStore, NewJob, provider_is_known};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const MAX_ROWS_PER_JOB: usize = 10_000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub cipher: Arc<CredentialCipher>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(submit_job))
        .route("/jobs/stream", get(status::stream_jobs))
        .route("/jobs/{id}", get(get_job))
        .route("/jobs/{id}/cancel", post(cancel_job))
        .with_state(state)
}

/// Authentication itself lives upstream; by the time a request reaches
/// this service the gateway has resolved the caller into this header.
pub fn user_id_from_headers(headers: &HeaderMap) -> Option<Uuid> {
    headers
        .get("x-user-id")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
}

#[derive(Debug)]
pub struct ApiError(StatusCode, String);

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self(StatusCode::BAD_REQUEST, message.into())
    }

    fn internal(error: anyhow::Error) -> Self {
        tracing::error!(error = %error, "request failed");
        Self(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal error".to_string(),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(serde_json::json!({ "error": self.1 }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub provider: String,
    pub model: String,
    pub api_key: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub task_type: Option<String>,
    pub rows: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub job_id: Uuid,
}

pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<SubmitJobResponse>), ApiError> {
    let user_id =
        user_id_from_headers(&headers).ok_or_else(|| ApiError(StatusCode::UNAUTHORIZED, "missing identity".into()))?;

    if request.rows.is_empty() {
        return Err(ApiError::bad_request("rows must not be empty"));
    }
    if request.rows.len() > MAX_ROWS_PER_JOB {
        return Err(ApiError::bad_request(format!(
            "at most {MAX_ROWS_PER_JOB} rows per job"
        )));
    }
    if !provider_is_known(&request.provider) {
        return Err(ApiError::bad_request(format!(
            "unknown provider: {}",
            request.provider
        )));
    }
    if request.model.trim().is_empty() || request.api_key.trim().is_empty() {
        return Err(ApiError::bad_request("model and api_key are required"));
    }

    let credential_enc = state
        .cipher
        .encrypt(&request.api_key)
        .map_err(ApiError::internal)?;

    let input_data: Vec<InputRow> = request
        .rows
        .into_iter()
        .enumerate()
        .map(|(i, input)| InputRow {
            index: i as i32,
            input,
        })
        .collect();

    let job_id = state
        .store
        .insert(NewJob {
            user_id,
            provider: request.provider,
            model: request.model,
            credential_enc,
            template: request.template,
            task_type: request.task_type,
            input_data,
        })
        .await
        .map_err(ApiError::internal)?;

    tracing::info!(job_id = %job_id, user_id = %user_id, "job submitted");
    Ok((StatusCode::ACCEPTED, Json(SubmitJobResponse { job_id })))
}

#[derive(Debug, Serialize)]
pub struct JobView {
    pub id: Uuid,
    pub status: JobStatus,
    pub progress: i32,
    pub processed_rows: i32,
    pub total_rows: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub results: Vec<RowResult>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            status: job.status,
            progress: job.progress,
            processed_rows: job.processed_rows,
            total_rows: job.total_rows,
            error: job.error,
            results: job.results.0,
        }
    }
}

async fn fetch_owned(state: &AppState, headers: &HeaderMap, id: Uuid) -> Result<Job, ApiError> {
    let user_id =
        user_id_from_headers(headers).ok_or_else(|| ApiError(StatusCode::UNAUTHORIZED, "missing identity".into()))?;
    let job = state
        .store
        .fetch(id)
        .await
        .map_err(ApiError::internal)?
        .filter(|job| job.user_id == user_id)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, "job not found".into()))?;
    Ok(job)
}

pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
    let job = fetch_owned(&state, &headers, id).await?;
    Ok(Json(job.into()))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let job = fetch_owned(&state, &headers, id).await?;
    let cancelled = state
        .store
        .cancel(job.id)
        .await
        .map_err(ApiError::internal)?;
    if cancelled {
        tracing::info!(job_id = %id, "job cancelled by submitter");
        Ok(StatusCode::OK)
    } else {
        Err(ApiError(
            StatusCode::CONFLICT,
            "job already finished".into(),
        ))
    }
}
