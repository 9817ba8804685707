//! Error types and handling for the moderation proxy.
//!
//! This module provides a unified error type [`AppError`] whose variants encode
//! retry policy intrinsically, and renders every error through the uniform
//! envelope `{"error": {"message", "type", "code", "details"?}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

use crate::core::error_types::*;
use crate::core::rate_limiter::RateLimitDecision;

/// Main error type for the application.
///
/// Retry policy is a property of the variant itself: only upstream 5xx and
/// transport failures are retryable, everything else reflects a client mistake
/// or a policy decision and must surface exactly once.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing or mismatched bearer token
    #[error("Invalid or missing API key")]
    Auth,

    /// Request validation failures (bad body, bad parameters)
    #[error("{message}")]
    BadRequest {
        message: String,
        code: &'static str,
    },

    /// HTTP method not accepted on this route
    #[error("Method not allowed")]
    MethodNotAllowed,

    /// Moderation verdict blocked the request
    #[error("Content flagged at risk level {risk_level}")]
    ContentViolation {
        risk_level: u8,
        log_id: String,
        partial: bool,
    },

    /// One of the three rate-limit tiers rejected the request
    #[error("Rate limit exceeded")]
    RateLimited(RateLimitDecision),

    /// Per-provider circuit breaker is open
    #[error("Service temporarily unavailable")]
    BreakerOpen,

    /// Process-wide burst breaker is open
    #[error("Too many requests")]
    BurstTripped,

    /// The primary provider answered with a non-2xx status; body preserved verbatim
    #[error("Upstream returned HTTP {status}")]
    Upstream { status: u16, body: Value },

    /// Transport-level failure talking to an upstream
    #[error("Upstream request failed: {0}")]
    Network(#[from] reqwest::Error),

    /// The moderation provider could not produce a verdict
    #[error("Moderation service unavailable: {0}")]
    ModerationUnavailable(String),

    /// No data on a streaming response within the inactivity window
    #[error("Stream inactivity timeout")]
    StreamTimeout,

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic internal server errors with custom message
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the retry engine may re-attempt the operation that failed.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Upstream { status, .. } => *status >= 500,
            AppError::Network(_) => true,
            _ => false,
        }
    }

    /// HTTP status for the client-facing response.
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth => StatusCode::UNAUTHORIZED,
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::ContentViolation { .. } => StatusCode::FORBIDDEN,
            AppError::RateLimited(_) | AppError::BurstTripped => StatusCode::TOO_MANY_REQUESTS,
            AppError::BreakerOpen | AppError::ModerationUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            AppError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            AppError::Network(e) => {
                if e.is_timeout() {
                    StatusCode::GATEWAY_TIMEOUT
                } else {
                    StatusCode::BAD_GATEWAY
                }
            }
            AppError::StreamTimeout => StatusCode::GATEWAY_TIMEOUT,
            AppError::Serialization(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            AppError::Auth => ERROR_TYPE_AUTHENTICATION,
            AppError::BadRequest { .. } | AppError::MethodNotAllowed => ERROR_TYPE_INVALID_REQUEST,
            AppError::ContentViolation { .. } => ERROR_TYPE_INVALID_REQUEST,
            AppError::RateLimited(_) | AppError::BurstTripped => ERROR_TYPE_RATE_LIMIT,
            AppError::BreakerOpen | AppError::ModerationUnavailable(_) => ERROR_TYPE_SERVICE,
            AppError::Upstream { .. } | AppError::Network(_) | AppError::StreamTimeout => {
                ERROR_TYPE_API
            }
            AppError::Serialization(_) | AppError::Internal(_) => ERROR_TYPE_API,
        }
    }

    fn error_code(&self) -> Value {
        match self {
            AppError::Auth => ERROR_CODE_INVALID_AUTH_KEY.into(),
            AppError::BadRequest { code, .. } => (*code).into(),
            AppError::MethodNotAllowed => ERROR_CODE_METHOD_NOT_ALLOWED.into(),
            AppError::ContentViolation { .. } => ERROR_CODE_CONTENT_VIOLATION.into(),
            AppError::RateLimited(_) | AppError::BurstTripped => {
                ERROR_CODE_RATE_LIMIT_EXCEEDED.into()
            }
            AppError::BreakerOpen | AppError::ModerationUnavailable(_) => {
                ERROR_CODE_SERVICE_UNAVAILABLE.into()
            }
            AppError::Upstream { status, .. } => (*status).into(),
            AppError::Network(_) => ERROR_CODE_SERVICE_UNAVAILABLE.into(),
            AppError::StreamTimeout => ERROR_CODE_STREAM_TIMEOUT.into(),
            AppError::Serialization(_) | AppError::Internal(_) => ERROR_CODE_INTERNAL.into(),
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            AppError::ContentViolation {
                risk_level,
                log_id,
                partial,
            } => Some(json!({
                "risk_level": risk_level,
                "log_id": log_id,
                "is_partial_check": partial,
            })),
            AppError::RateLimited(decision) => Some(json!({
                "tiers": decision.tiers,
            })),
            AppError::BurstTripped => Some(json!({
                "reason": REASON_GLOBAL_BREAKER,
            })),
            AppError::BreakerOpen => Some(json!({
                "circuit_breaker": true,
            })),
            _ => None,
        }
    }

    /// Uniform error envelope.
    ///
    /// Upstream errors preserve the provider's body verbatim when it already
    /// carries an `error` object, so the client sees the original message.
    pub fn envelope(&self) -> Value {
        if let AppError::Upstream { body, .. } = self {
            if body.get("error").is_some() {
                return body.clone();
            }
        }

        let mut error = json!({
            "message": self.to_string(),
            "type": self.error_type(),
            "code": self.error_code(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        json!({ "error": error })
    }

    /// Render the envelope as an in-band SSE error frame followed by the
    /// terminal `[DONE]` marker.
    pub fn sse_frame(&self) -> String {
        format!("data: {}\n\ndata: [DONE]\n\n", self.envelope())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = self.envelope();
        let mut response = (status, Json(body)).into_response();

        if let AppError::RateLimited(decision) = &self {
            for (name, value) in decision.headers() {
                if let Ok(v) = value.parse() {
                    response.headers_mut().insert(name, v);
                }
            }
        }

        response
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_error_envelope() {
        let err = AppError::Auth;
        assert_eq!(err.status(), StatusCode::UNAUTHORIZED);
        let body = err.envelope();
        assert_eq!(body["error"]["type"], "authentication_error");
        assert_eq!(body["error"]["code"], "invalid_auth_key");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_violation_carries_details() {
        let err = AppError::ContentViolation {
            risk_level: 5,
            log_id: "mod_123_abcdefgh".to_string(),
            partial: true,
        };
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        let body = err.envelope();
        assert_eq!(body["error"]["code"], "content_violation");
        assert_eq!(body["error"]["details"]["risk_level"], 5);
        assert_eq!(body["error"]["details"]["log_id"], "mod_123_abcdefgh");
        assert_eq!(body["error"]["details"]["is_partial_check"], true);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_upstream_5xx_is_retryable_4xx_is_not() {
        let e500 = AppError::Upstream {
            status: 500,
            body: json!({"error": {"message": "boom"}}),
        };
        assert!(e500.is_retryable());

        for status in [400u16, 401, 403, 404, 422] {
            let err = AppError::Upstream {
                status,
                body: json!({}),
            };
            assert!(!err.is_retryable(), "HTTP {} must not retry", status);
        }
    }

    #[test]
    fn test_upstream_body_preserved_verbatim() {
        let body = json!({"error": {"message": "model overloaded", "type": "server_error", "code": 500}});
        let err = AppError::Upstream {
            status: 500,
            body: body.clone(),
        };
        assert_eq!(err.envelope(), body);
    }

    #[test]
    fn test_breaker_open_envelope() {
        let err = AppError::BreakerOpen;
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = err.envelope();
        assert_eq!(body["error"]["code"], "service_unavailable");
        assert_eq!(body["error"]["details"]["circuit_breaker"], true);
    }

    #[test]
    fn test_burst_tripped_reason() {
        let body = AppError::BurstTripped.envelope();
        assert_eq!(
            body["error"]["details"]["reason"],
            "global_circuit_breaker_tripped"
        );
    }

    #[test]
    fn test_sse_frame_shape() {
        let frame = AppError::StreamTimeout.sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.contains("stream_timeout"));
        assert!(frame.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn test_method_not_allowed_response() {
        let response = AppError::MethodNotAllowed.into_response();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
