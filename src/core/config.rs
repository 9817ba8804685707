//! Configuration management for the moderation proxy.
//!
//! Configuration is an immutable snapshot taken from environment variables at
//! boot. Every knob has a default so a bare environment still yields a usable
//! (if locked-down) server.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Bearer token accepted from clients
    pub auth_key: String,

    /// Moderation provider (classifies content before forwarding)
    pub first_provider: ModerationProviderConfig,

    /// Primary provider (produces the actual answer)
    pub second_provider: PrimaryProviderConfig,

    pub timeouts: TimeoutConfig,
    pub rate_limits: RateLimitConfig,
    pub service_health: ServiceHealthConfig,

    /// Models exempt from moderation; `*` suffix globs supported
    pub whitelisted_models: Vec<String>,

    /// How moderation models are picked from the configured list
    pub moderation_strategy: SelectionStrategy,

    /// Risk level at or above which a verdict is a hard violation
    pub risk_block_threshold: u8,

    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationProviderConfig {
    pub url: String,
    pub key: String,
    /// Ordered model list; empty means moderation requests fail fast
    pub models: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrimaryProviderConfig {
    pub url: String,
    pub key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Total budget for the retry loop, in milliseconds
    pub max_retry_time_ms: u64,
    /// Base delay between attempts, in milliseconds
    pub retry_delay_ms: u64,
    /// Streaming inactivity watchdog, in milliseconds
    pub stream_timeout_ms: u64,
    pub max_retry_count: u32,
    pub enable_retry: bool,
}

impl TimeoutConfig {
    /// Per-attempt cap for moderation and unary primary calls.
    pub fn attempt_timeout_ms(&self) -> u64 {
        self.max_retry_time_ms / 2
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub chat_rpm: u32,
    pub images_rpm: u32,
    pub audio_rpm: u32,
    pub models_rpm: u32,
    pub global_ip_rpm: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceHealthConfig {
    /// Failures inside the window before the breaker trips
    pub max_errors: u32,
    /// Window after which the failure counter goes stale, in milliseconds
    pub error_window_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    RoundRobin,
    Random,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 18080,
        }
    }
}

impl AppConfig {
    /// Build the configuration snapshot from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup.
    ///
    /// Tests pass a map here instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let auth_key = lookup("AUTH_KEY").unwrap_or_default();
        if auth_key.trim().is_empty() {
            bail!("AUTH_KEY is required");
        }

        let models = lookup("FIRST_PROVIDER_MODELS")
            .map(|raw| split_csv(&raw))
            .unwrap_or_default();

        let moderation_strategy = match lookup("MODERATION_STRATEGY").as_deref() {
            Some("random") => SelectionStrategy::Random,
            Some("round_robin") | None => SelectionStrategy::RoundRobin,
            Some(other) => bail!("MODERATION_STRATEGY must be round_robin or random, got {other:?}"),
        };

        let risk_block_threshold = parse_or("RISK_BLOCK_THRESHOLD", 5u8, &lookup)?;
        if !(1..=5).contains(&risk_block_threshold) {
            bail!("RISK_BLOCK_THRESHOLD must be within 1..=5");
        }

        Ok(Self {
            auth_key,
            first_provider: ModerationProviderConfig {
                url: lookup("FIRST_PROVIDER_URL").unwrap_or_default(),
                key: lookup("FIRST_PROVIDER_KEY").unwrap_or_default(),
                models,
            },
            second_provider: PrimaryProviderConfig {
                url: lookup("SECOND_PROVIDER_URL").unwrap_or_default(),
                key: lookup("SECOND_PROVIDER_KEY").unwrap_or_default(),
            },
            timeouts: TimeoutConfig {
                max_retry_time_ms: parse_or("MAX_RETRY_TIME", 30_000, &lookup)?,
                retry_delay_ms: parse_or("RETRY_DELAY", 1_000, &lookup)?,
                stream_timeout_ms: parse_or("STREAM_TIMEOUT", 60_000, &lookup)?,
                max_retry_count: parse_or("MAX_RETRY_COUNT", 3, &lookup)?,
                enable_retry: lookup("ENABLE_RETRY")
                    .map(|v| str_to_bool(&v))
                    .unwrap_or(false),
            },
            rate_limits: RateLimitConfig {
                chat_rpm: parse_or("CHAT_RPM", 60, &lookup)?,
                images_rpm: parse_or("IMAGES_RPM", 20, &lookup)?,
                audio_rpm: parse_or("AUDIO_RPM", 20, &lookup)?,
                models_rpm: parse_or("MODELS_RPM", 100, &lookup)?,
                global_ip_rpm: parse_or("GLOBAL_IP_RPM", 120, &lookup)?,
            },
            service_health: ServiceHealthConfig {
                max_errors: parse_or("MAX_PROVIDER_ERRORS", 5, &lookup)?,
                error_window_ms: parse_or("PROVIDER_ERROR_WINDOW", 60_000, &lookup)?,
            },
            whitelisted_models: lookup("WHITELISTED_MODELS")
                .map(|raw| split_csv(&raw))
                .unwrap_or_default(),
            moderation_strategy,
            risk_block_threshold,
            server: ServerConfig {
                host: lookup("HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
                port: parse_or("PORT", 18080, &lookup)?,
            },
        })
    }
}

fn split_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_or<T: std::str::FromStr>(
    key: &str,
    default: T,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Result<T> {
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("{key} has invalid value {raw:?}")),
        None => Ok(default),
    }
}

/// Convert string to boolean.
///
/// Accepts: "true", "1", "yes", "on" (case-insensitive)
pub fn str_to_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "1" | "yes" | "on")
}
