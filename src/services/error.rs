//! Error handling utilities for route handlers

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::pipeline::PipelineError;

/// Errors surfaced to HTTP clients. The `Display` text is the message sent
/// in the JSON body.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("No video file uploaded")]
    MissingVideo,
    #[error("Invalid file type")]
    InvalidFileType,
    #[error("Malformed upload")]
    MalformedUpload,
    #[error("Upload too large")]
    PayloadTooLarge,
    #[error("Invalid video: {0}")]
    InvalidVideo(String),
    #[error("Not found")]
    NotFound,
    #[error("Internal server error")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingVideo | ApiError::InvalidFileType | ApiError::MalformedUpload => {
                StatusCode::BAD_REQUEST
            }
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::InvalidVideo(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(e: PipelineError) -> Self {
        match e {
            PipelineError::InvalidVideo(inner) => ApiError::InvalidVideo(inner.to_string()),
            other => {
                log::error!("[detect] Pipeline failed: {}", other);
                ApiError::Internal
            }
        }
    }
}

/// Extension trait for logging errors and converting to ApiError
pub trait LogErr<T> {
    /// Log error with context and return `ApiError::Internal`
    fn log_500(self, context: &str) -> Result<T, ApiError>;

    /// Log error with context and return a custom ApiError
    fn log_status(self, context: &str, status: ApiError) -> Result<T, ApiError>;
}

impl<T, E: std::fmt::Display> LogErr<T> for Result<T, E> {
    fn log_500(self, context: &str) -> Result<T, ApiError> {
        self.map_err(|e| {
            log::error!("{}: {}", context, e);
            ApiError::Internal
        })
    }

    fn log_status(self, context: &str, status: ApiError) -> Result<T, ApiError> {
        self.map_err(|e| {
            log::warn!("{}: {}", context, e);
            status
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frames::InvalidVideoError;

    #[test]
    fn test_client_errors_are_bad_request() {
        assert_eq!(ApiError::MissingVideo.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::InvalidFileType.status(), StatusCode::BAD_REQUEST);
        assert_eq!(ApiError::MissingVideo.to_string(), "No video file uploaded");
        assert_eq!(ApiError::InvalidFileType.to_string(), "Invalid file type");
    }

    #[test]
    fn test_pipeline_error_mapping() {
        let invalid = PipelineError::from(InvalidVideoError::new("frame rate is zero"));
        let api = ApiError::from(invalid);
        assert_eq!(api.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(api.to_string(), "Invalid video: frame rate is zero");

        let io = PipelineError::from(std::io::Error::other("disk full"));
        let api = ApiError::from(io);
        assert_eq!(api.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(api.to_string(), "Internal server error");
    }

    #[test]
    fn test_log_status_maps_error() {
        let result: Result<(), &str> = Err("boom");
        let mapped = result.log_status("context", ApiError::MalformedUpload);
        assert!(matches!(mapped, Err(ApiError::MalformedUpload)));
    }
}
