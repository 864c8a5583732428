//! Gateway error types and their OpenAI-shaped HTTP envelopes.
//!
//! Terminal dispatch failures surface to callers with the
//! `service_unavailable_error` code; transient instance failures never
//! reach this layer — the executor recovers them. The envelope shape is
//! `{"error": {"message", "type", "code"}}` for every failure path.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use relay_dispatch::DispatchError;
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Errors surfaced by the dispatch core
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Malformed or unsupported caller request
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// JSON serialization failures
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything else; maps to a 500
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl GatewayError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        GatewayError::InvalidRequest {
            message: message.into(),
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            GatewayError::Dispatch(e) => match e {
                DispatchError::NotFound { model } => (
                    StatusCode::NOT_FOUND,
                    "model_not_found",
                    format!("model not found: {model}"),
                ),
                DispatchError::Unavailable { message, trace } => {
                    tracing::warn!(trace = ?trace, "request exhausted all instances");
                    (
                        StatusCode::SERVICE_UNAVAILABLE,
                        "service_unavailable_error",
                        message.clone(),
                    )
                }
                DispatchError::Invalid { message } => (
                    StatusCode::BAD_REQUEST,
                    "invalid_request_error",
                    message.clone(),
                ),
                DispatchError::Conflict { message } => {
                    (StatusCode::CONFLICT, "conflict_error", message.clone())
                }
                DispatchError::Upstream(e) => (
                    StatusCode::BAD_GATEWAY,
                    "upstream_error",
                    e.to_string(),
                ),
                DispatchError::DeadlineExceeded => (
                    StatusCode::GATEWAY_TIMEOUT,
                    "timeout_error",
                    "request deadline exceeded".to_string(),
                ),
                DispatchError::Canceled => (
                    StatusCode::REQUEST_TIMEOUT,
                    "request_canceled",
                    "request canceled by caller".to_string(),
                ),
            },
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                message.clone(),
            ),
            GatewayError::Serialization(e) => (
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                e.to_string(),
            ),
            GatewayError::Internal { message } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                message.clone(),
            ),
        };

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}
