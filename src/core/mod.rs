//! Core functionality for the moderation proxy.
//!
//! This module contains fundamental components used throughout the application:
//! - Configuration management
//! - Error handling and the uniform error envelope
//! - Multi-tier rate limiting
//! - Circuit breakers
//! - HTTP middleware

pub mod breaker;
pub mod config;
pub mod error;
pub mod error_types;
pub mod middleware;
pub mod rate_limiter;

// Re-export commonly used types
pub use breaker::{BurstBreaker, ProviderBreaker};
pub use config::{AppConfig, SelectionStrategy};
pub use error::{AppError, Result};
pub use middleware::{client_ip, request_logging_middleware};
pub use rate_limiter::{RateLimitDecision, RateLimiter, Route};

/// Current wall-clock time as epoch milliseconds.
///
/// All limiter and breaker operations take an explicit timestamp so tests can
/// drive the clock; production callers go through this.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
