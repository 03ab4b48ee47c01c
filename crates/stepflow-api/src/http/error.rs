//! Application error type mapping to HTTP status codes and envelope format.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use stepflow_core::workflow::definition::WorkflowError;
use stepflow_core::workflow::engine::EngineError;
use stepflow_types::error::RepositoryError;

use crate::http::response::ApiResponse;

/// Application-level error that maps to HTTP responses.
#[derive(Debug)]
pub enum AppError {
    /// Errors surfaced by the workflow engine.
    Engine(EngineError),
    /// Malformed request (unparseable definition, bad query value).
    Validation(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        AppError::Engine(e)
    }
}

impl From<WorkflowError> for AppError {
    fn from(e: WorkflowError) -> Self {
        match e {
            WorkflowError::Validation(v) => AppError::Engine(EngineError::Validation(v)),
            other => AppError::Validation(other.to_string()),
        }
    }
}

impl AppError {
    /// HTTP status, machine-readable code and message for this error.
    pub fn parts(&self) -> (StatusCode, String, String) {
        match self {
            AppError::Engine(EngineError::NotFound { entity, .. }) => (
                StatusCode::NOT_FOUND,
                format!("{}_NOT_FOUND", entity.to_ascii_uppercase()),
                self.message(),
            ),
            AppError::Engine(EngineError::InvalidState(_)) => {
                (StatusCode::CONFLICT, "INVALID_STATE".to_string(), self.message())
            }
            AppError::Engine(EngineError::DefinitionInUse { .. }) => (
                StatusCode::CONFLICT,
                "DEFINITION_IN_USE".to_string(),
                self.message(),
            ),
            AppError::Engine(EngineError::Validation(_)) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR".to_string(),
                self.message(),
            ),
            AppError::Engine(EngineError::Repository(RepositoryError::NotFound)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND".to_string(), self.message())
            }
            AppError::Engine(EngineError::Repository(RepositoryError::Conflict(_))) => {
                (StatusCode::CONFLICT, "CONFLICT".to_string(), self.message())
            }
            AppError::Engine(EngineError::Repository(_)) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "REPOSITORY_ERROR".to_string(),
                self.message(),
            ),
            AppError::Validation(msg) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR".to_string(),
                msg.clone(),
            ),
        }
    }

    fn message(&self) -> String {
        match self {
            AppError::Engine(e) => e.to_string(),
            AppError::Validation(msg) => msg.clone(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = self.parts();
        if status.is_server_error() {
            tracing::error!(code = %code, "request failed: {message}");
        }

        let body = ApiResponse::error(&code, &message, String::new(), 0);
        (status, Json(body)).into_response()
    }
}
