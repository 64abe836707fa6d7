//! Rate Limiter
//!
//! Prevents abuse by limiting operation frequency, using `governor`'s
//! generalized cell-rate algorithm per named operation bucket.

use std::collections::HashMap;
use std::num::NonZeroU32;

use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as Governor};

type DirectLimiter = Governor<NotKeyed, InMemoryState, governor::clock::DefaultClock>;

struct Bucket {
    limiter: DirectLimiter,
    quota: Quota,
}

impl Bucket {
    fn per_minute(max: u32) -> Self {
        let quota = Quota::per_minute(NonZeroU32::new(max).unwrap_or(NonZeroU32::new(1).unwrap()));
        Self { limiter: Governor::direct(quota), quota }
    }

    fn try_consume(&self) -> bool {
        self.limiter.check().is_ok()
    }

    fn reset(&mut self) {
        self.limiter = Governor::direct(self.quota);
    }
}

/// Per-operation token buckets, keyed by operation name.
pub struct RateLimiter {
    buckets: HashMap<String, Bucket>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let mut buckets = HashMap::new();
        buckets.insert("web_search".to_string(), Bucket::per_minute(10));
        buckets.insert("code_exec".to_string(), Bucket::per_minute(5));
        buckets.insert("llm_call".to_string(), Bucket::per_minute(30));
        Self { buckets }
    }

    /// Check if a tool operation is allowed; unconfigured operations default to allowed.
    pub fn check_tool(&mut self, tool_name: &str) -> bool {
        match self.buckets.get(tool_name) {
            Some(bucket) => bucket.try_consume(),
            None => true,
        }
    }

    pub fn check_web_search(&mut self) -> bool {
        self.check_tool("web_search")
    }

    /// Reset all rate limiters, discarding accumulated consumption.
    pub fn reset(&mut self) {
        for bucket in self.buckets.values_mut() {
            bucket.reset();
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_exhausts_after_quota() {
        let bucket = Bucket::per_minute(3);
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(bucket.try_consume());
        assert!(!bucket.try_consume());
    }

    #[test]
    fn rate_limiter_enforces_web_search_quota() {
        let mut limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check_web_search());
        }
        assert!(!limiter.check_web_search());
    }

    #[test]
    fn reset_restores_quota() {
        let mut limiter = RateLimiter::new();
        for _ in 0..10 {
            assert!(limiter.check_web_search());
        }
        assert!(!limiter.check_web_search());
        limiter.reset();
        assert!(limiter.check_web_search());
    }

    #[test]
    fn unconfigured_operation_defaults_to_allowed() {
        let mut limiter = RateLimiter::new();
        for _ in 0..50 {
            assert!(limiter.check_tool("unconfigured_op"));
        }
    }
}
