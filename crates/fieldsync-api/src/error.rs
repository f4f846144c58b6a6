use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use fieldsync_core::storage::CloudError;
use fieldsync_core::sync::SyncError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Service unavailable: {0}")]
    Unavailable(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<fieldsync_core::Error> for AppError {
    fn from(error: fieldsync_core::Error) -> Self {
        match error {
            fieldsync_core::Error::InvalidInput(message) => Self::BadRequest(message),
            fieldsync_core::Error::NotFound(message) => Self::NotFound(message),
            fieldsync_core::Error::Cloud(CloudError::CircuitOpen) => {
                Self::Unavailable(CloudError::CircuitOpen.to_string())
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<SyncError> for AppError {
    fn from(error: SyncError) -> Self {
        match error {
            SyncError::Validation(error) => Self::BadRequest(error.to_string()),
            SyncError::Storage(error) => error.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
