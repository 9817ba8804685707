//! modgate - a two-stage content-moderation proxy for LLM backends
//!
//! This library implements an OpenAI-compatible reverse proxy that classifies
//! every chat-completion request with a moderation provider before relaying it
//! to the primary provider, including:
//!
//! - **Multi-tier rate limiting**: route, route-per-IP, and global-per-IP
//!   minute windows with idle-entry reclamation
//! - **Circuit breakers**: per-provider failure window plus a process-wide
//!   request-burst breaker
//! - **Retry with backoff**: bounded, disable-safe, non-retryable aware
//! - **Streaming relay**: byte-exact SSE passthrough with an inactivity
//!   watchdog and in-band error framing
//! - **Moderation loop prevention**: a pinned sentinel detects the proxy's own
//!   moderation traffic
//!
//! # Architecture
//!
//! The codebase is organized into three main layers:
//!
//! - [`core`]: configuration, errors, rate limiting, breakers, middleware
//! - [`api`]: HTTP handlers and the SSE relay
//! - [`services`]: moderation, forwarding, sampling, retry

pub mod api;
pub mod core;
pub mod services;

// Re-export commonly used types for convenience
pub use api::{build_router, AppState};
pub use core::{AppConfig, AppError, Result};
