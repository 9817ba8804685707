//! HTTP middleware and request metadata helpers.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};
use std::time::Instant;

/// Label used when no client address can be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Extract the client IP from proxy headers.
///
/// `x-forwarded-for` wins (first hop), then `x-real-ip`. Requests arriving
/// without either are grouped under one shared label, which keeps them subject
/// to the per-IP tiers rather than exempt from them.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    UNKNOWN_CLIENT.to_string()
}

/// Log every request with method, path, status, and duration.
pub async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed().as_secs_f64();
    let status = response.status().as_u16();
    tracing::info!(
        "{} {} - status={} duration={:.3}s",
        method,
        path,
        status,
        duration
    );

    response
}
