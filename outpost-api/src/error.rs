use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use outpost_orchestrator::OrchestratorError;
use serde_json::json;
use tracing::error;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Validation { field: String, detail: String },
    Unauthorized(String),
    Forbidden(String),
    Conflict(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            ApiError::Validation { field, detail } => (
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("Invalid {field}: {detail}"), "field": field }),
            ),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, json!({ "error": msg })),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, json!({ "error": msg })),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, json!({ "error": msg })),
            ApiError::Internal(msg) => {
                error!(error = %msg, "request failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "internal error" }),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        match err {
            OrchestratorError::NotFound(what) => ApiError::NotFound(format!("Not found: {what}")),
            OrchestratorError::InvalidInput(msg) | OrchestratorError::Protocol(msg) => {
                ApiError::BadRequest(msg)
            }
            OrchestratorError::Validation { field, detail } => ApiError::Validation { field, detail },
            OrchestratorError::Conflict(msg) | OrchestratorError::InvalidState(msg) => {
                ApiError::Conflict(msg)
            }
            OrchestratorError::Forbidden(msg) => ApiError::Forbidden(msg),
            other => ApiError::Internal(other.to_string()),
        }
    }
}
