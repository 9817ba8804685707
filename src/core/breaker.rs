//! Circuit breakers guarding the upstream providers and the process itself.
//!
//! Two breakers exist: a per-provider failure-window breaker for the primary
//! backend (the moderation path shares its state), and a process-wide burst
//! breaker that rejects request floods before any other work happens.

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovernorRateLimiter,
};
use nonzero_ext::nonzero;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::core::config::ServiceHealthConfig;
use crate::core::now_ms;

/// How long a tripped breaker stays open.
pub const TRIP_DURATION_MS: i64 = 60_000;

/// Requests per second tolerated before the burst breaker trips.
pub const BURST_THRESHOLD_PER_SEC: u32 = 500;

#[derive(Debug, Default)]
struct BreakerState {
    failure_count: u32,
    last_failure_ms: i64,
    tripped: bool,
    reset_at_ms: i64,
}

/// Failure-window breaker for the primary provider.
///
/// Failures are counted inside `error_window_ms`; once the count passes
/// `max_errors` the breaker opens for [`TRIP_DURATION_MS`] and `allow` answers
/// false until the trip expires. Expiry is cleared lazily on the next call and
/// by the background tick.
pub struct ProviderBreaker {
    max_errors: u32,
    error_window_ms: i64,
    state: Mutex<BreakerState>,
}

impl ProviderBreaker {
    pub fn new(health: &ServiceHealthConfig) -> Self {
        Self {
            max_errors: health.max_errors,
            error_window_ms: health.error_window_ms as i64,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(now_ms());
    }

    pub fn record_failure_at(&self, now_ms: i64) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        if state.last_failure_ms != 0 && now_ms - state.last_failure_ms > self.error_window_ms {
            state.failure_count = 0;
        }
        state.failure_count += 1;
        state.last_failure_ms = now_ms;

        if state.failure_count > self.max_errors && !state.tripped {
            state.tripped = true;
            state.reset_at_ms = now_ms + TRIP_DURATION_MS;
            state.failure_count = 0;
            tracing::warn!(
                reset_in_ms = TRIP_DURATION_MS,
                "Primary provider circuit breaker tripped"
            );
        }
    }

    /// Whether calls to the provider (and therefore to moderation) may proceed.
    pub fn allow(&self) -> bool {
        self.allow_at(now_ms())
    }

    pub fn allow_at(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        if state.tripped {
            if now_ms < state.reset_at_ms {
                return false;
            }
            state.tripped = false;
            state.failure_count = 0;
            state.reset_at_ms = 0;
            tracing::info!("Primary provider circuit breaker reset");
        }
        true
    }

    /// Lazy maintenance performed by the background tick: clears expired trips
    /// and drops failure counts that have gone stale.
    pub fn tick_at(&self, now_ms: i64) {
        let mut state = self.state.lock().expect("breaker mutex poisoned");
        if state.tripped && now_ms >= state.reset_at_ms {
            state.tripped = false;
            state.failure_count = 0;
            state.reset_at_ms = 0;
            tracing::info!("Primary provider circuit breaker reset");
        }
        if state.failure_count > 0 && now_ms - state.last_failure_ms > self.error_window_ms {
            state.failure_count = 0;
        }
    }

    /// Current failure count. Exposed for tests.
    pub fn failure_count(&self) -> u32 {
        self.state.lock().expect("breaker mutex poisoned").failure_count
    }

    pub fn spawn_ticker(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(10));
            tick.tick().await;
            loop {
                tick.tick().await;
                self.tick_at(now_ms());
            }
        })
    }
}

type BurstQuota = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

struct BurstState {
    quota: BurstQuota,
    tripped_until_ms: Option<i64>,
}

/// Process-wide burst breaker.
///
/// A per-second quota absorbs normal traffic; the first rejection trips the
/// breaker for [`TRIP_DURATION_MS`], after which the quota starts fresh.
pub struct BurstBreaker {
    per_second: NonZeroU32,
    state: Mutex<BurstState>,
}

impl BurstBreaker {
    pub fn new() -> Self {
        Self::with_threshold(nonzero!(500u32))
    }

    pub fn with_threshold(per_second: NonZeroU32) -> Self {
        Self {
            per_second,
            state: Mutex::new(BurstState {
                quota: Self::fresh_quota(per_second),
                tripped_until_ms: None,
            }),
        }
    }

    fn fresh_quota(per_second: NonZeroU32) -> BurstQuota {
        GovernorRateLimiter::direct(Quota::per_second(per_second))
    }

    /// Count one request; false means the caller must answer 429.
    pub fn check(&self) -> bool {
        self.check_at(now_ms())
    }

    pub fn check_at(&self, now_ms: i64) -> bool {
        let mut state = self.state.lock().expect("burst mutex poisoned");
        if let Some(until) = state.tripped_until_ms {
            if now_ms < until {
                return false;
            }
            state.tripped_until_ms = None;
            state.quota = Self::fresh_quota(self.per_second);
        }

        if state.quota.check().is_err() {
            state.tripped_until_ms = Some(now_ms + TRIP_DURATION_MS);
            tracing::warn!(
                threshold_per_sec = BURST_THRESHOLD_PER_SEC,
                "Global burst breaker tripped"
            );
            return false;
        }
        true
    }
}

impl Default for BurstBreaker {
    fn default() -> Self {
        Self::new()
    }
}
