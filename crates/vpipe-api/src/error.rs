//! API error types.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;
use tracing::error;
use vpipe_pipeline::PipelineError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job {0} is already transcoded")]
    AlreadyTranscoded(String),

    #[error("Job {0} failed transcoding; upload it again")]
    TranscodeFailed(String),

    #[error("Upload failed: {0}")]
    UploadFailed(#[source] PipelineError),

    #[error("Processing failed: {0}")]
    ProcessingFailed(#[source] PipelineError),
}

impl ApiError {
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Error from the upload path.
    pub fn upload(err: PipelineError) -> Self {
        Self::UploadFailed(err)
    }

    /// Error from transcode submission. Guard rejections keep their identity.
    pub fn submit(err: PipelineError) -> Self {
        match err {
            PipelineError::AlreadyTranscoded(id) => Self::AlreadyTranscoded(id.to_string()),
            PipelineError::TranscodeFailed(id) => Self::TranscodeFailed(id.to_string()),
            other => Self::ProcessingFailed(other),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) | ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::AlreadyTranscoded(_) | ApiError::TranscodeFailed(_) => StatusCode::CONFLICT,
            ApiError::ProcessingFailed(PipelineError::QueueUnavailable(_)) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            ApiError::UploadFailed(_) | ApiError::ProcessingFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match self {
            ApiError::Unauthorized(_) => "UNAUTHORIZED",
            ApiError::BadRequest(_) => "BAD_REQUEST",
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::AlreadyTranscoded(_) => "ALREADY_TRANSCODED",
            ApiError::TranscodeFailed(_) => "TRANSCODE_FAILED",
            ApiError::UploadFailed(_) => "UPLOAD_FAILED",
            ApiError::ProcessingFailed(_) => "PROCESSING_FAILED",
        }
    }
}

impl From<validator::ValidationErrors> for ApiError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::Validation(errors.to_string())
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        // Infrastructure causes stay in the logs.
        let detail = match &self {
            ApiError::UploadFailed(e) => {
                error!("Upload failed: {}", e);
                "Upload failed".to_string()
            }
            ApiError::ProcessingFailed(e) => {
                error!("Processing failed: {}", e);
                "Processing failed, try again".to_string()
            }
            _ => self.to_string(),
        };

        let body = ErrorResponse {
            detail,
            code: self.code(),
        };

        (status, Json(body)).into_response()
    }
}
