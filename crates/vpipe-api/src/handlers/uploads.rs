//! Upload URL and transcode submission handlers.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use validator::Validate;
use vpipe_models::JobId;

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Request body for `POST /api/upload-url`.
#[derive(Debug, Deserialize, Validate)]
pub struct UploadUrlRequest {
    #[validate(length(min = 1, max = 200, message = "Title must be between 1 and 200 characters"))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 5000, message = "Description must be at most 5000 characters"))]
    pub description: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadUrlResponse {
    pub job_id: String,
    pub upload_url: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /api/upload-url
///
/// Issue a presigned PUT URL for the source file and register the video.
pub async fn request_upload_url(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<UploadUrlRequest>,
) -> ApiResult<Json<UploadUrlResponse>> {
    request.validate()?;

    let ticket = state
        .coordinator
        .request_upload(&user.uid, request.title.trim(), &request.description)
        .await
        .map_err(ApiError::upload)?;

    Ok(Json(UploadUrlResponse {
        job_id: ticket.job_id.to_string(),
        upload_url: ticket.upload_url,
        expires_at: ticket.expires_at,
    }))
}

/// Request body for `POST /api/transcode`.
#[derive(Debug, Deserialize)]
pub struct TranscodeRequest {
    #[serde(rename = "jobId", alias = "videoID")]
    pub job_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscodeResponse {
    pub job_id: String,
    pub status: &'static str,
}

/// POST /api/transcode
///
/// Called once the client has finished uploading. Returns 202 when the job is queued.
pub async fn submit_transcode(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<TranscodeRequest>,
) -> ApiResult<(StatusCode, Json<TranscodeResponse>)> {
    let job_id = JobId::from_string(request.job_id.trim());
    if job_id.is_empty() {
        return Err(ApiError::bad_request("jobId is required"));
    }

    state
        .publisher
        .submit_transcode(&job_id)
        .await
        .map_err(ApiError::submit)?;

    info!(job_id = %job_id, uid = %user.uid, "Transcode requested");

    Ok((
        StatusCode::ACCEPTED,
        Json(TranscodeResponse {
            job_id: job_id.to_string(),
            status: "queued",
        }),
    ))
}
