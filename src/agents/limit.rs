//! Per-agent push rate limiting.

use dashmap::DashMap;
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use tracing::debug;

type DirectRateLimiter = governor::DefaultDirectRateLimiter;

/// Limiters are created lazily per agent id; the whole map is dropped once it
/// grows past this many ids.
const MAX_ENTRIES: usize = 10_000;

/// Token bucket per agent id.
#[derive(Debug)]
pub struct PushLimiter {
    limiters: DashMap<String, DirectRateLimiter>,
    per_minute: NonZeroU32,
}

impl PushLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            limiters: DashMap::new(),
            per_minute: NonZeroU32::new(per_minute).unwrap_or(NonZeroU32::MIN),
        }
    }

    /// Returns `true` if the agent may push now.
    pub fn check(&self, id: &str) -> bool {
        let limiter = self
            .limiters
            .entry(id.to_string())
            .or_insert_with(|| RateLimiter::direct(Quota::per_minute(self.per_minute)));

        let allowed = limiter.check().is_ok();
        if !allowed {
            debug!(agent = %id, "push rate limit exceeded");
        }
        allowed
    }

    pub fn cleanup(&self) {
        if self.limiters.len() > MAX_ENTRIES {
            self.limiters.clear();
            debug!("cleared push rate limiters (exceeded {} entries)", MAX_ENTRIES);
        }
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_then_reject() {
        let limiter = PushLimiter::new(3);
        assert!(limiter.check("edge-01"));
        assert!(limiter.check("edge-01"));
        assert!(limiter.check("edge-01"));
        assert!(!limiter.check("edge-01"));
        // Other agents have their own bucket.
        assert!(limiter.check("edge-02"));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn zero_rate_still_allows_one() {
        let limiter = PushLimiter::new(0);
        assert!(limiter.check("a"));
        assert!(!limiter.check("a"));
    }
}
