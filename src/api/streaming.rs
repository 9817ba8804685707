//! Server-Sent Events relay for chat completions.
//!
//! Upstream bytes pass through unchanged and in order. The relay owns the
//! upstream reader: each chunk read is raced against the inactivity deadline,
//! and on timeout or upstream error an in-band error frame plus a terminal
//! `data: [DONE]` is written before the connection closes. When the client
//! disconnects, dropping the body stream drops the upstream response with it.
//!
//! `[DONE]` policy: if the upstream already sent `data: [DONE]` the relay adds
//! nothing; if the upstream ended without it, exactly one is appended.

use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;

use crate::core::error::AppError;
use crate::core::rate_limiter::RateLimitDecision;
use crate::services::moderation::Verdict;

const DONE_MARKER: &str = "data: [DONE]";
const DONE_FRAME: &str = "data: [DONE]\n\n";

/// Carry length for detecting a `[DONE]` marker split across chunk boundaries.
/// Detection only; relayed bytes are never altered.
const DONE_CARRY_CHARS: usize = 15;

struct RelayState {
    upstream: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    inactivity: Duration,
    saw_done: bool,
    carry: String,
    finished: bool,
}

/// Relay an upstream streaming response to the client as SSE.
pub fn relay_sse(
    upstream: reqwest::Response,
    stream_timeout_ms: u64,
    verdict: Option<&Verdict>,
    rate: &RateLimitDecision,
) -> Response {
    let state = RelayState {
        upstream: Box::pin(upstream.bytes_stream()),
        inactivity: Duration::from_millis(stream_timeout_ms),
        saw_done: false,
        carry: String::new(),
        finished: false,
    };

    let byte_stream = futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }

        match tokio::time::timeout(state.inactivity, state.upstream.next()).await {
            Err(_elapsed) => {
                state.finished = true;
                tracing::warn!(
                    timeout_ms = state.inactivity.as_millis() as u64,
                    "Stream inactivity timeout, closing with in-band error"
                );
                let frame = AppError::StreamTimeout.sse_frame();
                Some((Ok::<Vec<u8>, std::io::Error>(frame.into_bytes()), state))
            }
            Ok(Some(Ok(bytes))) => {
                track_done_marker(&mut state, &bytes);
                Some((Ok(bytes.to_vec()), state))
            }
            Ok(Some(Err(e))) => {
                state.finished = true;
                tracing::error!(error = %e, "Upstream stream error");
                let frame = AppError::Network(e).sse_frame();
                Some((Ok(frame.into_bytes()), state))
            }
            Ok(None) => {
                state.finished = true;
                if state.saw_done {
                    None
                } else {
                    Some((Ok(DONE_FRAME.as_bytes().to_vec()), state))
                }
            }
        }
    });

    sse_response(Body::from_stream(byte_stream), verdict, rate)
}

/// A fixed-content SSE response, used when moderation blocks a streaming
/// request before the primary provider is ever contacted.
pub fn sse_static_response(
    frame: String,
    verdict: Option<&Verdict>,
    rate: &RateLimitDecision,
) -> Response {
    sse_response(Body::from(frame), verdict, rate)
}

fn sse_response(body: Body, verdict: Option<&Verdict>, rate: &RateLimitDecision) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive");

    for (name, value) in rate.headers() {
        builder = builder.header(name, value);
    }
    if let Some(verdict) = verdict {
        builder = builder
            .header("x-content-review-id", verdict.log_id.clone())
            .header("x-risk-level", verdict.risk_level.to_string());
        if verdict.is_partial {
            builder = builder.header("x-content-review-partial", "true");
        }
    }

    builder.body(body).unwrap_or_else(|_| {
        AppError::Internal("failed to build stream response".to_string()).into_response()
    })
}

fn track_done_marker(state: &mut RelayState, chunk: &[u8]) {
    let text = String::from_utf8_lossy(chunk);
    let mut window = std::mem::take(&mut state.carry);
    window.push_str(&text);
    if window.contains(DONE_MARKER) {
        state.saw_done = true;
    }
    let tail_start = window
        .char_indices()
        .rev()
        .nth(DONE_CARRY_CHARS - 1)
        .map(|(idx, _)| idx)
        .unwrap_or(0);
    state.carry = window[tail_start..].to_string();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::RateLimitConfig;
    use crate::core::rate_limiter::{RateLimiter, Route};

    fn rate_decision() -> RateLimitDecision {
        let limiter = RateLimiter::new(RateLimitConfig {
            chat_rpm: 60,
            images_rpm: 20,
            audio_rpm: 20,
            models_rpm: 100,
            global_ip_rpm: 120,
        });
        limiter.check_at(Route::Chat, "1.2.3.4", 1_000_000)
    }

    fn verdict() -> Verdict {
        Verdict {
            is_violation: false,
            risk_level: 1,
            log_id: "mod_1_abcdefgh".to_string(),
            is_partial: false,
        }
    }

    fn upstream_from_chunks(
        chunks: Vec<Result<&'static str, std::io::Error>>,
    ) -> reqwest::Response {
        let stream = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| chunk.map(Bytes::from)),
        );
        let body = reqwest::Body::wrap_stream(stream);
        let response = axum::http::Response::builder()
            .status(200)
            .body(body)
            .unwrap();
        reqwest::Response::from(response)
    }

    async fn collect_body(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_bytes_relayed_in_order() {
        let upstream = upstream_from_chunks(vec![
            Ok("data: {\"id\":\"1\"}\n\n"),
            Ok("data: {\"id\":\"2\"}\n\n"),
            Ok("data: [DONE]\n\n"),
        ]);
        let rate = rate_decision();
        let response = relay_sse(upstream, 5_000, Some(&verdict()), &rate);

        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        assert_eq!(response.headers().get("x-risk-level").unwrap(), "1");
        assert!(response.headers().get("x-ratelimit-limit").is_some());

        let body = collect_body(response).await;
        assert_eq!(
            body,
            "data: {\"id\":\"1\"}\n\ndata: {\"id\":\"2\"}\n\ndata: [DONE]\n\n"
        );
    }

    #[tokio::test]
    async fn test_done_appended_when_upstream_omits_it() {
        let upstream = upstream_from_chunks(vec![Ok("data: {\"id\":\"1\"}\n\n")]);
        let rate = rate_decision();
        let body = collect_body(relay_sse(upstream, 5_000, None, &rate)).await;
        assert!(body.ends_with(DONE_FRAME));
        assert_eq!(body.matches(DONE_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn test_done_not_duplicated() {
        let upstream = upstream_from_chunks(vec![
            Ok("data: {\"x\":1}\n\n"),
            Ok("data: [DONE]\n\n"),
        ]);
        let rate = rate_decision();
        let body = collect_body(relay_sse(upstream, 5_000, None, &rate)).await;
        assert_eq!(body.matches(DONE_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn test_done_detected_across_chunk_boundary() {
        let upstream = upstream_from_chunks(vec![
            Ok("data: {\"x\":1}\n\ndata: [DO"),
            Ok("NE]\n\n"),
        ]);
        let rate = rate_decision();
        let body = collect_body(relay_sse(upstream, 5_000, None, &rate)).await;
        assert_eq!(body.matches(DONE_MARKER).count(), 1);
    }

    #[tokio::test]
    async fn test_inactivity_timeout_emits_error_frame() {
        let stream = futures::stream::pending::<Result<Bytes, std::io::Error>>();
        let body = reqwest::Body::wrap_stream(stream);
        let response = axum::http::Response::builder()
            .status(200)
            .body(body)
            .unwrap();
        let upstream = reqwest::Response::from(response);

        let rate = rate_decision();
        let body = collect_body(relay_sse(upstream, 50, None, &rate)).await;
        assert!(body.contains("stream_timeout"));
        assert!(body.ends_with(DONE_FRAME));
    }

    #[tokio::test]
    async fn test_upstream_error_framed_in_band() {
        let upstream = upstream_from_chunks(vec![
            Ok("data: {\"x\":1}\n\n"),
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone")),
        ]);
        let rate = rate_decision();
        let body = collect_body(relay_sse(upstream, 5_000, None, &rate)).await;
        assert!(body.starts_with("data: {\"x\":1}\n\n"));
        assert!(body.contains("\"error\""));
        assert!(body.ends_with(DONE_FRAME));
    }

    #[tokio::test]
    async fn test_partial_review_header() {
        let upstream = upstream_from_chunks(vec![Ok("data: [DONE]\n\n")]);
        let rate = rate_decision();
        let partial = Verdict {
            is_partial: true,
            ..verdict()
        };
        let response = relay_sse(upstream, 5_000, Some(&partial), &rate);
        assert_eq!(
            response.headers().get("x-content-review-partial").unwrap(),
            "true"
        );
    }

    #[tokio::test]
    async fn test_static_violation_response() {
        let rate = rate_decision();
        let violation = AppError::ContentViolation {
            risk_level: 5,
            log_id: "mod_9_zzzzzzzz".to_string(),
            partial: false,
        };
        let blocked = Verdict {
            is_violation: true,
            risk_level: 5,
            log_id: "mod_9_zzzzzzzz".to_string(),
            is_partial: false,
        };
        let response = sse_static_response(violation.sse_frame(), Some(&blocked), &rate);
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-risk-level").unwrap(), "5");

        let body = collect_body(response).await;
        assert!(body.starts_with("data: {"));
        assert!(body.contains("content_violation"));
        assert!(body.ends_with(DONE_FRAME));
    }
}
