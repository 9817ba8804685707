//! Shared constants for structured API errors.

pub const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
pub const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
pub const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
pub const ERROR_TYPE_API: &str = "api_error";
pub const ERROR_TYPE_SERVICE: &str = "service_error";

pub const ERROR_CODE_INVALID_AUTH_KEY: &str = "invalid_auth_key";
pub const ERROR_CODE_CONTENT_VIOLATION: &str = "content_violation";
pub const ERROR_CODE_STREAM_TIMEOUT: &str = "stream_timeout";
pub const ERROR_CODE_SERVICE_UNAVAILABLE: &str = "service_unavailable";
pub const ERROR_CODE_INTERNAL: &str = "internal_error";
pub const ERROR_CODE_INVALID_TEMPERATURE: &str = "invalid_temperature";
pub const ERROR_CODE_RATE_LIMIT_EXCEEDED: &str = "rate_limit_exceeded";
pub const ERROR_CODE_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
pub const ERROR_CODE_INVALID_REQUEST: &str = "invalid_request";

/// Reason string reported when the process-wide burst breaker rejects a request.
pub const REASON_GLOBAL_BREAKER: &str = "global_circuit_breaker_tripped";
