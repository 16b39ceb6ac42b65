use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::message::ValidationError;
use crate::queue::QueueError;
use crate::tenant::ResolveError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<ResolveError> for AppError {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::Repository(e) => AppError::Unavailable(e.to_string()),
            not_found => AppError::NotFound(not_found.to_string()),
        }
    }
}

impl AppError {
    /// Attach the request id used in the response envelope.
    pub fn for_request(self, request: impl Into<String>) -> ApiError {
        ApiError {
            request: request.into(),
            error: self,
        }
    }
}

/// An [`AppError`] bound to the request that produced it.
#[derive(Debug)]
pub struct ApiError {
    pub request: String,
    pub error: AppError,
}

/// Response body shared by accepted and rejected requests.
#[derive(Debug, Serialize)]
pub struct Envelope {
    pub status: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub request: String,
}

impl Envelope {
    pub fn accepted(request: impl Into<String>) -> Self {
        Self {
            status: 1,
            error: None,
            request: request.into(),
        }
    }

    pub fn rejected(error: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            status: 0,
            error: Some(error.into()),
            request: request.into(),
        }
    }
}

/// Check if running in production mode (based on RUN_MODE env var)
fn is_production() -> bool {
    std::env::var("RUN_MODE")
        .map(|m| m == "production" || m == "prod")
        .unwrap_or(false)
}

impl AppError {
    fn parts(&self) -> (StatusCode, &'static str, String, String) {
        match self {
            AppError::Config(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Configuration error".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "CONFIG_ERROR", client_msg, log_msg)
            }
            AppError::Validation(e) => (
                StatusCode::BAD_REQUEST,
                "VALIDATION_ERROR",
                e.to_string(),
                e.to_string(),
            ),
            AppError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                "BAD_REQUEST",
                msg.clone(),
                msg.clone(),
            ),
            AppError::NotFound(msg) => (
                StatusCode::NOT_FOUND,
                "NOT_FOUND",
                msg.clone(),
                msg.clone(),
            ),
            AppError::Queue(e) => {
                let log_msg = e.to_string();
                let client_msg = if is_production() {
                    "Unable to queue message".to_string()
                } else {
                    log_msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "QUEUE_ERROR", client_msg, log_msg)
            }
            AppError::Unavailable(msg) => {
                let client_msg = if is_production() {
                    "Service temporarily unavailable".to_string()
                } else {
                    msg.clone()
                };
                (StatusCode::SERVICE_UNAVAILABLE, "UNAVAILABLE", client_msg, msg.clone())
            }
            AppError::Internal(msg) => {
                let client_msg = if is_production() {
                    "Internal server error".to_string()
                } else {
                    msg.clone()
                };
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", client_msg, msg.clone())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, client_message, log_message) = self.error.parts();

        // Always log the detailed error server-side
        if status.is_server_error() {
            tracing::error!(
                code = %code,
                status = %status.as_u16(),
                request = %self.request,
                message = %log_message,
                "API error"
            );
        } else {
            tracing::info!(
                code = %code,
                status = %status.as_u16(),
                request = %self.request,
                message = %log_message,
                "Request rejected"
            );
        }

        (status, Json(Envelope::rejected(client_message, self.request))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
