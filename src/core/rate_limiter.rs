//! Multi-tier rate limiting with minute windows.
//!
//! Every inbound request is checked against three independent minute windows:
//! the route total, the per-IP share of the route, and the per-IP total across
//! all routes. Counters live in a single [`DashMap`] keyed by (ip, bucket) so
//! each read-modify-write is atomic per key without a global lock.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::RateLimitConfig;
use crate::core::now_ms;

/// Window length for all tiers.
pub const WINDOW_MS: i64 = 60_000;

/// Client entries with no activity for this long are reclaimed by the sweeper.
pub const IDLE_RECLAIM_MS: i64 = 300_000;

/// Per-IP share of a route's RPM.
const IP_PATH_SHARE: f64 = 0.25;

/// Routes subject to rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Route {
    Chat,
    Images,
    Audio,
    Models,
}

impl Route {
    pub fn as_str(self) -> &'static str {
        match self {
            Route::Chat => "chat",
            Route::Images => "images",
            Route::Audio => "audio",
            Route::Models => "models",
        }
    }
}

/// Which window a counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Bucket {
    /// Route total across all clients; the ip component of the key is empty
    Path(Route),
    /// One client's requests to one route
    IpPath(Route),
    /// One client's requests across all routes
    GlobalIp,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterKey {
    ip: String,
    bucket: Bucket,
}

#[derive(Debug)]
struct Window {
    count: u32,
    window_start_ms: i64,
}

/// Outcome of one tier's check, also reported in 429 error details.
#[derive(Debug, Clone, Serialize)]
pub struct TierStatus {
    pub scope: &'static str,
    pub limit: u32,
    pub remaining: u32,
    /// Epoch milliseconds at which this tier's window resets
    pub reset_ms: i64,
    /// Whether this tier's count went past its limit
    pub exceeded: bool,
}

/// Combined decision across all three tiers.
#[derive(Debug, Clone)]
pub struct RateLimitDecision {
    pub limited: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_ms: i64,
    pub tiers: Vec<TierStatus>,
}

impl RateLimitDecision {
    /// Standard rate-limit headers, emitted on both limited and allowed
    /// responses.
    pub fn headers(&self) -> [(&'static str, String); 3] {
        [
            ("x-ratelimit-limit", self.limit.to_string()),
            ("x-ratelimit-remaining", self.remaining.to_string()),
            ("x-ratelimit-reset", (self.reset_ms / 1000).to_string()),
        ]
    }
}

/// Process-local rate limiter over composite-keyed minute windows.
pub struct RateLimiter {
    counters: DashMap<CounterKey, Window>,
    limits: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(limits: RateLimitConfig) -> Self {
        Self {
            counters: DashMap::new(),
            limits,
        }
    }

    fn route_limit(&self, route: Route) -> u32 {
        match route {
            Route::Chat => self.limits.chat_rpm,
            Route::Images => self.limits.images_rpm,
            Route::Audio => self.limits.audio_rpm,
            Route::Models => self.limits.models_rpm,
        }
    }

    /// Per-IP limit for a route. The same figure is used for enforcement and
    /// header reporting.
    fn ip_route_limit(&self, route: Route) -> u32 {
        (self.route_limit(route) as f64 * IP_PATH_SHARE).floor() as u32
    }

    /// Check and count one request. Exactly one call per inbound request.
    pub fn check(&self, route: Route, client_ip: &str) -> RateLimitDecision {
        self.check_at(route, client_ip, now_ms())
    }

    /// Clock-injected variant of [`check`](Self::check) for deterministic tests.
    pub fn check_at(&self, route: Route, client_ip: &str, now_ms: i64) -> RateLimitDecision {
        let tiers = [
            (
                CounterKey {
                    ip: String::new(),
                    bucket: Bucket::Path(route),
                },
                self.route_limit(route),
                "route",
            ),
            (
                CounterKey {
                    ip: client_ip.to_string(),
                    bucket: Bucket::IpPath(route),
                },
                self.ip_route_limit(route),
                "route_ip",
            ),
            (
                CounterKey {
                    ip: client_ip.to_string(),
                    bucket: Bucket::GlobalIp,
                },
                self.limits.global_ip_rpm,
                "global_ip",
            ),
        ];

        let mut statuses = Vec::with_capacity(3);
        for (key, limit, scope) in tiers {
            statuses.push(self.bump(key, limit, scope, now_ms));
        }
        let limited = statuses.iter().any(|t| t.exceeded);

        let limit = statuses.iter().map(|t| t.limit).min().unwrap_or(0);
        let remaining = statuses.iter().map(|t| t.remaining).min().unwrap_or(0);
        let reset_ms = statuses.iter().map(|t| t.reset_ms).min().unwrap_or(now_ms);

        RateLimitDecision {
            limited,
            limit,
            remaining,
            reset_ms,
            tiers: statuses,
        }
    }

    fn bump(&self, key: CounterKey, limit: u32, scope: &'static str, now_ms: i64) -> TierStatus {
        let mut entry = self.counters.entry(key).or_insert(Window {
            count: 0,
            window_start_ms: now_ms,
        });
        let window = entry.value_mut();
        if now_ms - window.window_start_ms > WINDOW_MS {
            window.count = 0;
            window.window_start_ms = now_ms;
        }
        window.count += 1;

        TierStatus {
            scope,
            limit,
            remaining: limit.saturating_sub(window.count),
            reset_ms: window.window_start_ms + WINDOW_MS,
            exceeded: window.count > limit,
        }
    }

    /// Drop expired route windows and reclaim idle client entries.
    pub fn sweep_at(&self, now_ms: i64) {
        self.counters.retain(|key, window| {
            let age = now_ms - window.window_start_ms;
            if key.ip.is_empty() {
                age <= WINDOW_MS
            } else {
                age <= IDLE_RECLAIM_MS
            }
        });
    }

    /// Number of live counter entries. Exposed for tests and logging.
    pub fn tracked_entries(&self) -> usize {
        self.counters.len()
    }

    /// Periodic sweep resetting expired windows and reclaiming idle IPs.
    pub fn spawn_sweeper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            tick.tick().await;
            loop {
                tick.tick().await;
                let before = self.tracked_entries();
                self.sweep_at(now_ms());
                let after = self.tracked_entries();
                if before != after {
                    tracing::debug!(reclaimed = before - after, "Rate-limit sweep reclaimed entries");
                }
            }
        })
    }
}
