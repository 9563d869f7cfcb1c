//! Per-tunnel sliding-window rate limiting.
//!
//! Two backends behind one trait: Redis counters shared across server
//! processes, and an in-process map when no Redis is configured. The check
//! is never allowed to stall the hot path: the whole Redis round-trip runs
//! under a 200 ms budget and fails open.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use dashmap::DashMap;
use fred::clients::Client;
use fred::interfaces::*;
use fred::types::config::Config as RedisConfig;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, warn};

use tunlink_shared::{RateLimits, Window};

use crate::metrics::Metrics;

/// Budget for one full minute/hour/day check against Redis.
const REDIS_BUDGET: Duration = Duration::from_millis(200);

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allow,
    Deny { retry_after_secs: u64 },
}

impl RateDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, RateDecision::Deny { .. })
    }
}

/// One increment-and-compare over the three windows.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, tunnel_id: &str, limits: &RateLimits) -> RateDecision;
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// In-process fallback backend.
pub struct MemoryRateLimiter {
    /// counter key -> (count, absolute expiry epoch).
    counters: DashMap<String, (u32, u64)>,
}

impl MemoryRateLimiter {
    pub fn new() -> Arc<Self> {
        let limiter = Arc::new(Self {
            counters: DashMap::new(),
        });
        limiter.clone().spawn_sweeper();
        limiter
    }

    #[cfg(test)]
    pub fn new_unswept() -> Arc<Self> {
        Arc::new(Self {
            counters: DashMap::new(),
        })
    }

    fn spawn_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let now = now_epoch();
                self.counters.retain(|_, (_, expires)| *expires > now);
            }
        });
    }

    fn check_at(&self, tunnel_id: &str, limits: &RateLimits, now: u64) -> RateDecision {
        for window in Window::ALL {
            let key = window.counter_key(tunnel_id, now);
            let mut entry = self
                .counters
                .entry(key)
                .or_insert_with(|| (0, now + window.ttl_secs()));
            entry.0 += 1;
            if entry.0 > window.limit(limits) {
                return RateDecision::Deny {
                    retry_after_secs: window.secs_until_rollover(now),
                };
            }
        }
        RateDecision::Allow
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn check(&self, tunnel_id: &str, limits: &RateLimits) -> RateDecision {
        self.check_at(tunnel_id, limits, now_epoch())
    }
}

/// Redis-backed distributed backend.
pub struct RedisRateLimiter {
    client: Client,
    metrics: Metrics,
}

impl RedisRateLimiter {
    /// Connect and verify with a ping.
    pub async fn connect(redis_url: &str, metrics: Metrics) -> anyhow::Result<Arc<Self>> {
        let config = RedisConfig::from_url(redis_url)?;
        let client = Client::new(config, None, None, None);
        client.init().await?;
        client.ping::<()>(None).await?;
        Ok(Arc::new(Self { client, metrics }))
    }

    async fn check_counters(&self, tunnel_id: &str, limits: &RateLimits) -> anyhow::Result<RateDecision> {
        let now = now_epoch();
        for window in Window::ALL {
            let key = window.counter_key(tunnel_id, now);
            let count: i64 = self.client.incr(&key).await?;
            if count == 1 {
                // First increment in this bucket owns the TTL.
                self.client
                    .expire::<(), _>(&key, window.ttl_secs() as i64, None)
                    .await?;
            }
            if count > window.limit(limits) as i64 {
                return Ok(RateDecision::Deny {
                    retry_after_secs: window.secs_until_rollover(now),
                });
            }
        }
        Ok(RateDecision::Allow)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn check(&self, tunnel_id: &str, limits: &RateLimits) -> RateDecision {
        match timeout(REDIS_BUDGET, self.check_counters(tunnel_id, limits)).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => {
                warn!(%err, "rate-limit backend error, failing open");
                self.metrics.ratelimit_failopen();
                RateDecision::Allow
            }
            Err(_) => {
                debug!("rate-limit check exceeded budget, failing open");
                self.metrics.ratelimit_failopen();
                RateDecision::Allow
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(per_minute: u32) -> RateLimits {
        RateLimits {
            per_minute,
            per_hour: 10_000,
            per_day: 100_000,
        }
    }

    #[test]
    fn test_monotonic_within_bucket() {
        let limiter = MemoryRateLimiter::new_unswept();
        let limits = limits(5);
        let now = 1_700_000_000;

        let mut decisions = Vec::new();
        for _ in 0..8 {
            decisions.push(limiter.check_at("t-1", &limits, now).is_denied());
        }
        // allow x5 then deny forever within the bucket.
        assert_eq!(decisions, vec![false, false, false, false, false, true, true, true]);
    }

    #[test]
    fn test_bucket_rollover_resets_minute() {
        let limiter = MemoryRateLimiter::new_unswept();
        let limits = limits(1);
        let now = 1_700_000_000;

        assert!(!limiter.check_at("t-1", &limits, now).is_denied());
        assert!(limiter.check_at("t-1", &limits, now + 1).is_denied());
        // Next minute bucket.
        assert!(!limiter.check_at("t-1", &limits, now + 60).is_denied());
    }

    #[test]
    fn test_retry_after_is_rollover_distance() {
        let limiter = MemoryRateLimiter::new_unswept();
        let limits = limits(1);
        // 20 seconds into a minute bucket.
        let now = 1_700_000_000 - (1_700_000_000 % 60) + 20;

        limiter.check_at("t-1", &limits, now);
        match limiter.check_at("t-1", &limits, now) {
            RateDecision::Deny { retry_after_secs } => assert_eq!(retry_after_secs, 40),
            RateDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn test_tunnels_are_isolated() {
        let limiter = MemoryRateLimiter::new_unswept();
        let limits = limits(1);
        let now = 1_700_000_000;

        assert!(!limiter.check_at("t-1", &limits, now).is_denied());
        assert!(limiter.check_at("t-1", &limits, now).is_denied());
        assert!(!limiter.check_at("t-2", &limits, now).is_denied());
    }

    #[test]
    fn test_hour_window_denies_past_hour_limit() {
        let limiter = MemoryRateLimiter::new_unswept();
        let limits = RateLimits {
            per_minute: 10,
            per_hour: 3,
            per_day: 100,
        };
        let now = 1_700_000_000 - (1_700_000_000 % 3600);

        // Spread over minutes so the minute window never trips.
        assert!(!limiter.check_at("t-1", &limits, now).is_denied());
        assert!(!limiter.check_at("t-1", &limits, now + 60).is_denied());
        assert!(!limiter.check_at("t-1", &limits, now + 120).is_denied());
        assert!(limiter.check_at("t-1", &limits, now + 180).is_denied());
    }
}
