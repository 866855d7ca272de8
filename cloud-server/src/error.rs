//! Error handling

use axum::{
    response::{IntoResponse, Response},
    http::StatusCode,
    Json,
};
use serde_json::json;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub enum AppError {
    // Ingest errors
    SignatureMismatch,
    MalformedEnvelope(String),
    MalformedPayload(String),

    // Resource errors
    NotFound(String),

    // Generic errors
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::SignatureMismatch => {
                tracing::warn!("Rejected alert: signature mismatch");
                (StatusCode::UNAUTHORIZED, "Signature mismatch")
            }
            AppError::MalformedEnvelope(msg) => {
                tracing::warn!("Rejected envelope: {}", msg);
                (StatusCode::BAD_REQUEST, msg.as_str())
            }
            AppError::MalformedPayload(msg) => {
                tracing::warn!("Rejected payload: {}", msg);
                (StatusCode::UNPROCESSABLE_ENTITY, msg.as_str())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}
