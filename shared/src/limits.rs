//! Rate-limit window math.
//!
//! Counters live in fixed epoch buckets so that every server process,
//! and every limiter backend, derives the same key for the same instant.

use serde::{Deserialize, Serialize};

/// Per-tunnel request ceilings. Stamped from an API key at admission or
/// taken from process defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            per_minute: 120,
            per_hour: 3600,
            per_day: 50_000,
        }
    }
}

/// The three counting windows, checked shortest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Minute,
    Hour,
    Day,
}

impl Window {
    pub const ALL: [Window; 3] = [Window::Minute, Window::Hour, Window::Day];

    /// Window length, which is also the counter TTL.
    pub fn ttl_secs(&self) -> u64 {
        match self {
            Window::Minute => 60,
            Window::Hour => 3600,
            Window::Day => 86_400,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
            Window::Day => "day",
        }
    }

    /// Epoch bucket index for a given unix timestamp.
    pub fn bucket(&self, epoch_secs: u64) -> u64 {
        epoch_secs / self.ttl_secs()
    }

    /// Counter key: `tunnel:ratelimit:<id>:<window>:<bucket>`.
    pub fn counter_key(&self, tunnel_id: &str, epoch_secs: u64) -> String {
        format!(
            "tunnel:ratelimit:{}:{}:{}",
            tunnel_id,
            self.name(),
            self.bucket(epoch_secs)
        )
    }

    /// Ceiling for this window out of a limit set.
    pub fn limit(&self, limits: &RateLimits) -> u32 {
        match self {
            Window::Minute => limits.per_minute,
            Window::Hour => limits.per_hour,
            Window::Day => limits.per_day,
        }
    }

    /// Seconds until the current bucket rolls over, for `Retry-After`.
    pub fn secs_until_rollover(&self, epoch_secs: u64) -> u64 {
        let ttl = self.ttl_secs();
        ttl - (epoch_secs % ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_is_stable_within_window() {
        let w = Window::Minute;
        assert_eq!(w.bucket(120), w.bucket(179));
        assert_ne!(w.bucket(120), w.bucket(180));
    }

    #[test]
    fn test_counter_key_shape() {
        let key = Window::Hour.counter_key("t-1", 7200);
        assert_eq!(key, "tunnel:ratelimit:t-1:hour:2");
    }

    #[test]
    fn test_rollover_bounds() {
        assert_eq!(Window::Minute.secs_until_rollover(60), 60);
        assert_eq!(Window::Minute.secs_until_rollover(119), 1);
    }

    #[test]
    fn test_window_limits() {
        let limits = RateLimits {
            per_minute: 5,
            per_hour: 50,
            per_day: 500,
        };
        assert_eq!(Window::Minute.limit(&limits), 5);
        assert_eq!(Window::Day.limit(&limits), 500);
    }
}
