use http::StatusCode;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum ShutterboxError {
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Remote store unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("Remote store rejected record {id}: {reason}")]
    RemoteRejected { id: String, reason: String },

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Work queue closed")]
    QueueClosed,

    #[error("Operation timed out after {0}s")]
    Timeout(u64),
}

pub type Result<T> = std::result::Result<T, ShutterboxError>;

impl From<std::io::Error> for ShutterboxError {
    fn from(e: std::io::Error) -> Self {
        ShutterboxError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for ShutterboxError {
    fn from(e: serde_json::Error) -> Self {
        ShutterboxError::Json(e.to_string())
    }
}

impl ShutterboxError {
    /// Wrap any failure of the durable log as a `Storage` error.
    pub fn storage(e: impl std::fmt::Display) -> Self {
        ShutterboxError::Storage(e.to_string())
    }

    /// Connectivity-class failures are retried by rescheduling; everything
    /// else is either fatal to the caller or pinned to a single record.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ShutterboxError::RemoteUnavailable(_) | ShutterboxError::Timeout(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ShutterboxError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShutterboxError::RecordNotFound(_) => StatusCode::NOT_FOUND,
            ShutterboxError::InvalidRecord(_) => StatusCode::BAD_REQUEST,
            ShutterboxError::RemoteUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ShutterboxError::RemoteRejected { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ShutterboxError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShutterboxError::Json(_) => StatusCode::BAD_REQUEST,
            ShutterboxError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ShutterboxError::QueueClosed => StatusCode::SERVICE_UNAVAILABLE,
            ShutterboxError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ShutterboxError::Storage(_) => "storage_error",
            ShutterboxError::RecordNotFound(_) => "record_not_found",
            ShutterboxError::InvalidRecord(_) => "invalid_record",
            ShutterboxError::RemoteUnavailable(_) => "remote_unavailable",
            ShutterboxError::RemoteRejected { .. } => "remote_rejected",
            ShutterboxError::Io(_) => "io_error",
            ShutterboxError::Json(_) => "json_error",
            ShutterboxError::Config(_) => "config_error",
            ShutterboxError::QueueClosed => "queue_closed",
            ShutterboxError::Timeout(_) => "timeout",
        }
    }
}

// Axum IntoResponse implementation (feature-gated)
#[cfg(feature = "axum-support")]
use axum::response::{IntoResponse, Json, Response};
#[cfg(feature = "axum-support")]
use serde::Serialize;

#[cfg(feature = "axum-support")]
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[cfg(feature = "axum-support")]
impl IntoResponse for ShutterboxError {
    fn into_response(self) -> Response {
        let suggestion = match &self {
            ShutterboxError::Storage(_) => {
                Some("The capture was not saved; retry the whole capture".to_string())
            }
            ShutterboxError::QueueClosed | ShutterboxError::RemoteUnavailable(_) => {
                Some("Retry after a short delay".to_string())
            }
            _ => None,
        };

        let body = ErrorResponse {
            error: self.error_code().to_string(),
            message: self.to_string(),
            request_id: format!("req_sb_{}", uuid::Uuid::new_v4()),
            suggestion,
        };

        (self.status_code(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ShutterboxError::RemoteUnavailable("down".into()).is_retryable());
        assert!(ShutterboxError::Timeout(300).is_retryable());
        assert!(!ShutterboxError::Storage("disk full".into()).is_retryable());
        assert!(!ShutterboxError::RemoteRejected {
            id: "a".into(),
            reason: "bad".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_storage_maps_to_500() {
        let err = ShutterboxError::storage("no space left on device");
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Storage error: no space left on device");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ShutterboxError = io.into();
        assert!(matches!(err, ShutterboxError::Io(_)));
    }
}
