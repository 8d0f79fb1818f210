//! Gateway error surface: maps engine errors onto the HTTP contract.
//!
//! Status mapping:
//! - 400 malformed request (and upstream 400 passthrough)
//! - 401 missing or invalid caller key
//! - 404 model unknown to the gateway, upstream 404 passthrough
//! - 413 oversized body
//! - 429 caller rate-limited
//! - 502 every candidate failed (body carries the aggregated classes,
//!   never upstream bodies)
//! - 504 request-wide timeout

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use switchyard_core::{DispatchError, FailureClass};

#[derive(Error, Debug)]
pub enum GatewayError {
    /// Errors surfaced by the dispatch engine
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Caller authentication failures
    #[error("authentication error: {message}")]
    Auth { message: String },

    /// Caller exceeded its configured request rate
    #[error("rate limit exceeded: {message}")]
    RateLimited { message: String },

    /// Malformed inbound request
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    /// Request-wide timeout elapsed before dispatch finished
    #[error("request timed out")]
    Timeout,

    /// JSON serialization errors while building a response
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let (status, error_type, message, extra) = match &self {
            GatewayError::Dispatch(e) => return dispatch_response(e),
            GatewayError::Auth { message } => (
                StatusCode::UNAUTHORIZED,
                "authentication_error",
                message.clone(),
                None,
            ),
            GatewayError::RateLimited { message } => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limit_error",
                message.clone(),
                None,
            ),
            GatewayError::InvalidRequest { message } => (
                StatusCode::BAD_REQUEST,
                "invalid_request",
                message.clone(),
                None,
            ),
            GatewayError::Timeout => (
                StatusCode::GATEWAY_TIMEOUT,
                "timeout",
                self.to_string(),
                None,
            ),
            GatewayError::Serialization(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                self.to_string(),
                None,
            ),
        };
        error_body(status, error_type, &message, extra)
    }
}

fn dispatch_response(error: &DispatchError) -> Response {
    match error {
        DispatchError::InvalidRequest { message } => {
            error_body(StatusCode::BAD_REQUEST, "invalid_request", message, None)
        }
        DispatchError::ModelUnavailable { model } => error_body(
            StatusCode::NOT_FOUND,
            "model_not_found",
            &format!("no provider can serve model '{model}'"),
            None,
        ),
        DispatchError::Rejected { provider, source } => {
            let status = source
                .status()
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::BAD_REQUEST);
            error_body(
                status,
                "provider_request_error",
                &source.to_string(),
                Some(json!({"provider": provider})),
            )
        }
        DispatchError::StreamAborted { provider, .. } => error_body(
            StatusCode::BAD_GATEWAY,
            "stream_aborted",
            &format!("stream from provider '{provider}' aborted"),
            Some(json!({"provider": provider})),
        ),
        DispatchError::AllProvidersFailed(report) => {
            let error_type = match report.dominant_class() {
                FailureClass::Auth => "provider_auth_error",
                FailureClass::RateLimited => "provider_rate_limited",
                _ => "provider_server_error",
            };
            let attempts: Vec<_> = report
                .attempts
                .iter()
                .map(|a| {
                    json!({
                        "provider": a.provider,
                        "class": a.class.as_str(),
                        "message": a.message,
                    })
                })
                .collect();
            error_body(
                StatusCode::BAD_GATEWAY,
                error_type,
                &format!(
                    "all providers failed for model '{}' after {} attempts",
                    report.model,
                    report.attempts.len()
                ),
                Some(json!({"attempts": attempts})),
            )
        }
        DispatchError::Cancelled => error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "request_cancelled",
            "request cancelled",
            None,
        ),
    }
}

fn error_body(
    status: StatusCode,
    error_type: &str,
    message: &str,
    extra: Option<serde_json::Value>,
) -> Response {
    let mut error = json!({
        "message": message,
        "type": error_type,
        "code": status.as_u16(),
    });
    if let (Some(obj), Some(serde_json::Value::Object(extra))) = (error.as_object_mut(), extra) {
        for (key, value) in extra {
            obj.insert(key, value);
        }
    }
    (status, Json(json!({ "error": error }))).into_response()
}
