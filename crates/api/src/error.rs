use axum::{Json, http::StatusCode, response::IntoResponse};
use kindling_domain::ports::automation::AutomationError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("request was cancelled by a newer or higher priority operation")]
    Cancelled,
    #[error("request timed out waiting for a higher priority operation")]
    Timeout,
    #[error("error waiting for a higher priority operation")]
    Coordination,
    #[error("automation session lost, retry the request: {0}")]
    Retryable(String),
    #[error("emulator unavailable: {0}")]
    Unavailable(String),
    #[error("automation failed: {0}")]
    Automation(String),
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Cancelled => StatusCode::CONFLICT,
            ApiError::Timeout => StatusCode::REQUEST_TIMEOUT,
            ApiError::Coordination | ApiError::Automation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Retryable(_) | ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Cancelled => "request_cancelled",
            ApiError::Timeout => "request_timeout",
            ApiError::Coordination => "coordination_error",
            ApiError::Retryable(_) => "session_lost",
            ApiError::Unavailable(_) => "emulator_unavailable",
            ApiError::Automation(_) => "automation_error",
        }
    }
}

impl From<AutomationError> for ApiError {
    fn from(err: AutomationError) -> Self {
        match err {
            AutomationError::Cancelled => ApiError::Cancelled,
            AutomationError::Retryable(message) => ApiError::Retryable(message),
            AutomationError::Failed(message) => ApiError::Automation(message),
            AutomationError::Unavailable(message) => ApiError::Unavailable(message),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
