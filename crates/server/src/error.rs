use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use db::models::{run::RunError, run_event::RunEventError, thread::ThreadError};
use services::services::execution::ExecutionError;
use thiserror::Error;
use utils::response::ApiResponse;

#[derive(Debug, Error, ts_rs::TS)]
#[ts(type = "string")]
pub enum ApiError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Bad Request: {0}")]
    BadRequest(String),
    #[error("Not Found: {0}")]
    NotFound(String),
    #[error("Gateway Timeout: {0}")]
    GatewayTimeout(String),
    #[error("Internal Server Error: {0}")]
    InternalError(String),
}

impl From<ThreadError> for ApiError {
    fn from(err: ThreadError) -> Self {
        match err {
            ThreadError::Database(e) => ApiError::Database(e),
            ThreadError::NotFound => ApiError::NotFound("Thread not found".into()),
        }
    }
}

impl From<RunError> for ApiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Database(e) => ApiError::Database(e),
            RunError::NotFound => ApiError::NotFound("Run not found".into()),
            RunError::InvalidTransition(msg) => ApiError::Conflict(msg),
        }
    }
}

impl From<RunEventError> for ApiError {
    fn from(err: RunEventError) -> Self {
        match err {
            RunEventError::Database(e) => ApiError::Database(e),
        }
    }
}

impl From<ExecutionError> for ApiError {
    fn from(err: ExecutionError) -> Self {
        match err {
            ExecutionError::AlreadyRunning(id) => {
                ApiError::Conflict(format!("Run {id} is already running"))
            }
            ExecutionError::JoinTimeout(id) => {
                ApiError::GatewayTimeout(format!("Timed out waiting for run {id}"))
            }
            ExecutionError::Run(e) => e.into(),
            ExecutionError::Thread(e) => e.into(),
            ExecutionError::RunEvent(e) => e.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status_code, error_type) = match &self {
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DatabaseError"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "ConflictError"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BadRequest"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NotFound"),
            ApiError::GatewayTimeout(_) => (StatusCode::GATEWAY_TIMEOUT, "GatewayTimeout"),
            ApiError::InternalError(_) => (StatusCode::INTERNAL_SERVER_ERROR, "InternalError"),
        };

        let error_message = match &self {
            ApiError::Conflict(msg)
            | ApiError::BadRequest(msg)
            | ApiError::NotFound(msg)
            | ApiError::GatewayTimeout(msg)
            | ApiError::InternalError(msg) => msg.clone(),
            _ => format!("{}: {}", error_type, self),
        };
        let response = ApiResponse::<()>::error(&error_message);
        (status_code, Json(response)).into_response()
    }
}
