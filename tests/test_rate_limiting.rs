//! Rate limiting and dispatch tests through the full router.

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use modgate::core::config::{
    AppConfig, ModerationProviderConfig, PrimaryProviderConfig, RateLimitConfig, SelectionStrategy,
    ServerConfig, ServiceHealthConfig, TimeoutConfig,
};
use modgate::{build_router, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const AUTH: &str = "Bearer test-master-key";

fn test_config(moderation_url: &str, primary_url: &str, chat_rpm: u32) -> AppConfig {
    AppConfig {
        auth_key: "test-master-key".to_string(),
        first_provider: ModerationProviderConfig {
            url: moderation_url.to_string(),
            key: "mod-key".to_string(),
            models: vec!["guard-1".to_string()],
        },
        second_provider: PrimaryProviderConfig {
            url: primary_url.to_string(),
            key: "primary-key".to_string(),
        },
        timeouts: TimeoutConfig {
            max_retry_time_ms: 30_000,
            retry_delay_ms: 10,
            stream_timeout_ms: 5_000,
            max_retry_count: 3,
            enable_retry: false,
        },
        rate_limits: RateLimitConfig {
            chat_rpm,
            images_rpm: 100,
            audio_rpm: 100,
            models_rpm: 100,
            global_ip_rpm: 10_000,
        },
        service_health: ServiceHealthConfig {
            max_errors: 5,
            error_window_ms: 60_000,
        },
        whitelisted_models: vec![],
        moderation_strategy: SelectionStrategy::RoundRobin,
        risk_block_threshold: 5,
        server: ServerConfig::default(),
    }
}

fn build_app(config: AppConfig) -> Router {
    let client = reqwest::Client::builder()
        .build()
        .expect("Failed to build HTTP client");
    let state = Arc::new(AppState::new(config, client));
    build_router(state)
}

async fn mount_providers(moderation: &MockServer, primary: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "{\"isViolation\": false, \"riskLevel\": 1}"
                },
                "finish_reason": "stop"
            }]
        })))
        .mount(moderation)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}]
        })))
        .mount(primary)
        .await;
}

fn chat_request(ip: &str) -> Request<Body> {
    Request::builder()
        .uri("/v1/chat/completions")
        .method("POST")
        .header("content-type", "application/json")
        .header("authorization", AUTH)
        .header("x-forwarded-for", ip)
        .body(Body::from(
            json!({
                "model": "gpt-4",
                "messages": [{"role": "user", "content": "hi"}]
            })
            .to_string(),
        ))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_burst_of_three_with_rpm_eight() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    mount_providers(&moderation, &primary).await;

    // chat_rpm=8 gives each IP floor(8*0.25)=2 requests per minute
    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 8));

    let first = app.clone().oneshot(chat_request("1.2.3.4")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(chat_request("1.2.3.4")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(
        second.headers().get("x-ratelimit-remaining").unwrap(),
        "0"
    );

    let third = app.clone().oneshot(chat_request("1.2.3.4")).await.unwrap();
    assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(third.headers().get("x-ratelimit-remaining").unwrap(), "0");

    // reset is roughly one window from now
    let reset: i64 = third
        .headers()
        .get("x-ratelimit-reset")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let now_secs = chrono::Utc::now().timestamp();
    assert!((reset - now_secs).abs() <= 61, "reset {reset} vs now {now_secs}");

    let body = body_json(third).await;
    assert_eq!(body["error"]["type"], "rate_limit_error");
    assert_eq!(body["error"]["code"], "rate_limit_exceeded");
    // tier breakdown names all three windows
    let tiers = body["error"]["details"]["tiers"].as_array().unwrap();
    let scopes: Vec<&str> = tiers
        .iter()
        .map(|t| t["scope"].as_str().unwrap())
        .collect();
    assert_eq!(scopes, vec!["route", "route_ip", "global_ip"]);

    // another client is unaffected
    let other = app.clone().oneshot(chat_request("5.6.7.8")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_rate_limited_request_skips_providers() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;

    // chat_rpm=4 -> one request per IP; the second must not reach providers
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": "{\"isViolation\": false, \"riskLevel\": 1}"
                }
            }]
        })))
        .expect(1)
        .mount(&moderation)
        .await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "ok"}}]
        })))
        .expect(1)
        .mount(&primary)
        .await;

    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 4));

    let first = app.clone().oneshot(chat_request("1.2.3.4")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(chat_request("1.2.3.4")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_rate_headers_present_on_success() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    mount_providers(&moderation, &primary).await;

    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 100));
    let response = app.oneshot(chat_request("9.9.9.9")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    for header in ["x-ratelimit-limit", "x-ratelimit-remaining", "x-ratelimit-reset"] {
        assert!(
            response.headers().get(header).is_some(),
            "{header} missing on success"
        );
    }
}

#[tokio::test]
async fn test_method_not_allowed() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 100));

    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("GET")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "method_not_allowed");
}

#[tokio::test]
async fn test_options_answered_with_204() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 100));

    let request = Request::builder()
        .uri("/v1/chat/completions")
        .method("OPTIONS")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_unknown_route_404_envelope() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 100));

    let request = Request::builder()
        .uri("/v1/nonexistent")
        .method("POST")
        .header("authorization", AUTH)
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn test_health_endpoint() {
    let moderation = MockServer::start().await;
    let primary = MockServer::start().await;
    let app = build_app(test_config(&moderation.uri(), &primary.uri(), 100));

    let request = Request::builder()
        .uri("/health")
        .method("GET")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
}
