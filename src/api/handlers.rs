//! HTTP request handlers and the request dispatch pipeline.
//!
//! Chat completions run the full mediation pipeline: burst breaker, body
//! parse, self-loop check, rate limit, auth, moderation, then the forward to
//! the primary provider (unary or streamed). Images, audio, and model listing
//! are straight authenticated proxies that reuse only the rate limiter and the
//! error formatter.

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::core::breaker::{BurstBreaker, ProviderBreaker};
use crate::core::config::AppConfig;
use crate::core::error::{AppError, Result};
use crate::core::error_types::ERROR_CODE_INVALID_REQUEST;
use crate::core::middleware::{client_ip, request_logging_middleware};
use crate::core::rate_limiter::{RateLimitDecision, RateLimiter, Route};
use crate::services::forwarder::{build_payload, Forwarder};
use crate::services::moderation::{contains_sentinel, ModerationEngine, Verdict};
use crate::services::retry::RetryPolicy;

use super::streaming::{relay_sse, sse_static_response};

/// Shared application state.
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub http_client: reqwest::Client,
    pub rate_limiter: Arc<RateLimiter>,
    pub breaker: Arc<ProviderBreaker>,
    pub burst: Arc<BurstBreaker>,
    pub moderation: ModerationEngine,
    pub forwarder: Forwarder,
    pub retry: RetryPolicy,
}

impl AppState {
    pub fn new(config: AppConfig, http_client: reqwest::Client) -> Self {
        let config = Arc::new(config);
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
        let breaker = Arc::new(ProviderBreaker::new(&config.service_health));
        let burst = Arc::new(BurstBreaker::new());
        let moderation = ModerationEngine::new(&config, http_client.clone());
        let forwarder = Forwarder::new(&config, http_client.clone(), breaker.clone());
        let retry = RetryPolicy::from_config(&config.timeouts);

        Self {
            config,
            http_client,
            rate_limiter,
            breaker,
            burst,
            moderation,
            forwarder,
            retry,
        }
    }
}

/// Build the router with all endpoints and middleware.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route(
            "/v1/chat/completions",
            post(chat_completions)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/v1/images/generations",
            post(images_generations)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/v1/audio/transcriptions",
            post(audio_transcriptions)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route(
            "/v1/models",
            get(list_models)
                .options(preflight)
                .fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .fallback(not_found)
        .layer(axum::middleware::from_fn(request_logging_middleware))
        .layer(cors_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

/// Handle chat completion requests through the full mediation pipeline.
#[tracing::instrument(skip(state, headers, body))]
pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let payload = parse_json_body(&body)?;

    if !state.burst.check() {
        return Err(AppError::BurstTripped);
    }

    let messages = payload
        .get("messages")
        .and_then(|m| m.as_array())
        .cloned()
        .unwrap_or_default();

    // Our own moderation traffic looped back in must never be re-moderated.
    let sentinel_present = contains_sentinel(&messages);

    let ip = client_ip(&headers);
    let rate = state.rate_limiter.check(Route::Chat, &ip);
    if rate.limited {
        return Err(AppError::RateLimited(rate));
    }

    verify_auth(&headers, &state)?;

    if !state.breaker.allow() {
        return Err(AppError::BreakerOpen);
    }

    // Validate and assemble the downstream request before spending any
    // moderation budget on a request that could never be forwarded.
    let downstream = build_payload(&payload)?;

    let model = payload
        .get("model")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let is_stream = payload
        .get("stream")
        .and_then(|s| s.as_bool())
        .unwrap_or(false);

    let whitelisted = !model.is_empty() && state.moderation.is_whitelisted(&model);
    let verdict = if sentinel_present || whitelisted {
        tracing::debug!(
            model = %model,
            sentinel = sentinel_present,
            "Skipping moderation for exempt request"
        );
        None
    } else {
        let verdict = state.moderation.review(&messages).await?;
        tracing::debug!(
            risk_level = verdict.risk_level,
            violation = verdict.is_violation,
            log_id = %verdict.log_id,
            "Moderation verdict received"
        );
        if verdict.is_violation {
            return Ok(violation_response(&verdict, &rate, is_stream));
        }
        Some(verdict)
    };

    if is_stream {
        let upstream = state
            .retry
            .run(|| state.forwarder.send_stream(&downstream))
            .await?;
        Ok(relay_sse(
            upstream,
            state.config.timeouts.stream_timeout_ms,
            verdict.as_ref(),
            &rate,
        ))
    } else {
        let data = state
            .retry
            .run(|| state.forwarder.send_unary(&downstream))
            .await?;
        let mut response = Json(data).into_response();
        apply_rate_headers(&mut response, &rate);
        if let Some(verdict) = &verdict {
            apply_verdict_headers(&mut response, verdict);
        }
        Ok(response)
    }
}

fn violation_response(verdict: &Verdict, rate: &RateLimitDecision, is_stream: bool) -> Response {
    let err = AppError::ContentViolation {
        risk_level: verdict.risk_level,
        log_id: verdict.log_id.clone(),
        partial: verdict.is_partial,
    };
    if is_stream {
        return sse_static_response(err.sse_frame(), Some(verdict), rate);
    }
    let mut response = err.into_response();
    apply_rate_headers(&mut response, rate);
    apply_verdict_headers(&mut response, verdict);
    response
}

/// Straight proxy to the primary provider's image generation endpoint.
#[tracing::instrument(skip(state, headers, body))]
pub async fn images_generations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    proxy_post(&state, &headers, &body, Route::Images, "/images/generations").await
}

/// Straight proxy to the primary provider's transcription endpoint.
#[tracing::instrument(skip(state, headers, body))]
pub async fn audio_transcriptions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    proxy_post(&state, &headers, &body, Route::Audio, "/audio/transcriptions").await
}

/// Straight proxy to the primary provider's model listing.
#[tracing::instrument(skip(state, headers))]
pub async fn list_models(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Response> {
    if !state.burst.check() {
        return Err(AppError::BurstTripped);
    }

    let ip = client_ip(&headers);
    let rate = state.rate_limiter.check(Route::Models, &ip);
    if rate.limited {
        return Err(AppError::RateLimited(rate));
    }

    verify_auth(&headers, &state)?;

    let url = format!(
        "{}/models",
        state.config.second_provider.url.trim_end_matches('/')
    );
    let response = state
        .http_client
        .get(&url)
        .bearer_auth(&state.config.second_provider.key)
        .timeout(std::time::Duration::from_millis(
            state.config.timeouts.attempt_timeout_ms(),
        ))
        .send()
        .await
        .map_err(AppError::Network)?;

    relay_upstream(response, &rate).await
}

async fn proxy_post(
    state: &AppState,
    headers: &HeaderMap,
    body: &Bytes,
    route: Route,
    path: &str,
) -> Result<Response> {
    let payload = parse_json_body(body)?;

    if !state.burst.check() {
        return Err(AppError::BurstTripped);
    }

    let ip = client_ip(headers);
    let rate = state.rate_limiter.check(route, &ip);
    if rate.limited {
        return Err(AppError::RateLimited(rate));
    }

    verify_auth(headers, state)?;

    let url = format!(
        "{}{}",
        state.config.second_provider.url.trim_end_matches('/'),
        path
    );
    let response = state
        .http_client
        .post(&url)
        .bearer_auth(&state.config.second_provider.key)
        .timeout(std::time::Duration::from_millis(
            state.config.timeouts.attempt_timeout_ms(),
        ))
        .json(&payload)
        .send()
        .await
        .map_err(AppError::Network)?;

    relay_upstream(response, &rate).await
}

/// Relay an upstream response (status and JSON body) to the client with the
/// rate-limit headers attached.
async fn relay_upstream(response: reqwest::Response, rate: &RateLimitDecision) -> Result<Response> {
    let status = response.status();
    let bytes = response.bytes().await.map_err(AppError::Network)?;
    let body: Value = serde_json::from_slice(&bytes).unwrap_or_else(|_| {
        json!({
            "error": {
                "message": String::from_utf8_lossy(&bytes).to_string(),
                "type": "api_error",
                "code": status.as_u16(),
            }
        })
    });

    let mut relayed = (
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        Json(body),
    )
        .into_response();
    apply_rate_headers(&mut relayed, rate);
    Ok(relayed)
}

fn verify_auth(headers: &HeaderMap, state: &AppState) -> Result<()> {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match provided {
        Some(key) if key == state.config.auth_key => Ok(()),
        _ => Err(AppError::Auth),
    }
}

fn parse_json_body(body: &Bytes) -> Result<Value> {
    serde_json::from_slice::<Value>(body)
        .ok()
        .filter(|v| v.is_object())
        .ok_or(AppError::BadRequest {
            message: "request body must be a JSON object".to_string(),
            code: ERROR_CODE_INVALID_REQUEST,
        })
}

fn apply_rate_headers(response: &mut Response, rate: &RateLimitDecision) {
    for (name, value) in rate.headers() {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

fn apply_verdict_headers(response: &mut Response, verdict: &Verdict) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&verdict.log_id) {
        headers.insert(HeaderName::from_static("x-content-review-id"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&verdict.risk_level.to_string()) {
        headers.insert(HeaderName::from_static("x-risk-level"), value);
    }
    if verdict.is_partial {
        headers.insert(
            HeaderName::from_static("x-content-review-partial"),
            HeaderValue::from_static("true"),
        );
    }
}

async fn preflight() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn method_not_allowed() -> AppError {
    AppError::MethodNotAllowed
}

async fn not_found() -> Response {
    let body = json!({
        "error": {
            "message": "unknown endpoint",
            "type": "invalid_request_error",
            "code": 404,
        }
    });
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body_accepts_objects() {
        let body = Bytes::from_static(b"{\"model\": \"gpt-4\"}");
        assert!(parse_json_body(&body).is_ok());
    }

    #[test]
    fn test_parse_json_body_rejects_garbage_and_non_objects() {
        for raw in [&b"not json"[..], &b"[1,2,3]"[..], &b"\"text\""[..], &b""[..]] {
            let body = Bytes::copy_from_slice(raw);
            assert!(parse_json_body(&body).is_err());
        }
    }
}
