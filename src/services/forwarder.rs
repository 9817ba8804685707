//! Primary-provider forwarder.
//!
//! Builds the downstream chat-completion request, validates model-specific
//! constraints, and performs the call either as a unary JSON exchange or as a
//! streaming response handed to the relay. Every failure raised by the HTTP
//! call itself records one breaker failure.

use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use crate::core::breaker::ProviderBreaker;
use crate::core::config::{AppConfig, PrimaryProviderConfig};
use crate::core::error::{AppError, Result};
use crate::core::error_types::ERROR_CODE_INVALID_TEMPERATURE;

/// Default completion budget when the client sends none.
const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Optional fields relayed verbatim when present.
const OPTIONAL_FIELDS: &[&str] = &["response_format", "tools"];

pub struct Forwarder {
    provider: PrimaryProviderConfig,
    attempt_timeout: Duration,
    client: reqwest::Client,
    breaker: Arc<ProviderBreaker>,
}

impl Forwarder {
    pub fn new(config: &AppConfig, client: reqwest::Client, breaker: Arc<ProviderBreaker>) -> Self {
        Self {
            provider: config.second_provider.clone(),
            attempt_timeout: Duration::from_millis(config.timeouts.attempt_timeout_ms()),
            client,
            breaker,
        }
    }

    fn url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.provider.url.trim_end_matches('/')
        )
    }

    /// POST the request and decode the JSON body.
    pub async fn send_unary(&self, payload: &Value) -> Result<Value> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.provider.key)
            .timeout(self.attempt_timeout)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                AppError::Network(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = read_error_body(response).await;
            return Err(AppError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        response.json().await.map_err(|e| {
            self.breaker.record_failure();
            AppError::Network(e)
        })
    }

    /// POST with a streaming response. A non-2xx status is buffered and
    /// surfaced with the provider's original error body; a 2xx response is
    /// returned untouched for the relay.
    pub async fn send_stream(&self, payload: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.provider.key)
            .json(payload)
            .send()
            .await
            .map_err(|e| {
                self.breaker.record_failure();
                AppError::Network(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            self.breaker.record_failure();
            let body = read_error_body(response).await;
            return Err(AppError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

async fn read_error_body(response: reqwest::Response) -> Value {
    let status = response.status();
    match response.bytes().await {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            json!({
                "error": {
                    "message": String::from_utf8_lossy(&bytes).to_string(),
                    "type": "api_error",
                    "code": status.as_u16(),
                }
            })
        }),
        Err(_) => json!({
            "error": {
                "message": format!("HTTP {status}"),
                "type": "api_error",
                "code": status.as_u16(),
            }
        }),
    }
}

/// Assemble the downstream request body from the client payload.
///
/// Relays `model`, `messages`, `stream`, `temperature`, and `max_tokens`
/// (defaulted), plus `response_format` and `tools` when present, and enforces
/// model constraints before any network traffic happens.
pub fn build_payload(client_payload: &Value) -> Result<Value> {
    let model = client_payload
        .get("model")
        .and_then(|m| m.as_str())
        .ok_or_else(|| AppError::BadRequest {
            message: "model is required".to_string(),
            code: crate::core::error_types::ERROR_CODE_INVALID_REQUEST,
        })?;

    let messages = client_payload
        .get("messages")
        .and_then(|m| m.as_array())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| AppError::BadRequest {
            message: "messages must be a non-empty array".to_string(),
            code: crate::core::error_types::ERROR_CODE_INVALID_REQUEST,
        })?;

    let temperature = client_payload.get("temperature").cloned();
    validate_model_constraints(model, temperature.as_ref())?;

    let mut payload = json!({
        "model": model,
        "messages": messages,
        "stream": client_payload.get("stream").and_then(|s| s.as_bool()).unwrap_or(false),
        "max_tokens": client_payload
            .get("max_tokens")
            .and_then(|t| t.as_u64())
            .unwrap_or(DEFAULT_MAX_TOKENS),
    });
    if let Some(temperature) = temperature {
        payload["temperature"] = temperature;
    }
    for field in OPTIONAL_FIELDS {
        if let Some(value) = client_payload.get(*field) {
            payload[*field] = value.clone();
        }
    }

    Ok(payload)
}

/// Model families with parameter restrictions are rejected before dispatch.
fn validate_model_constraints(model: &str, temperature: Option<&Value>) -> Result<()> {
    if model.to_lowercase().contains("o3") {
        let temp = temperature.and_then(|t| t.as_f64()).unwrap_or(0.0);
        if temp != 0.0 {
            return Err(AppError::BadRequest {
                message: format!("model {model} requires temperature=0"),
                code: ERROR_CODE_INVALID_TEMPERATURE,
            });
        }
    }
    Ok(())
}
