//! In-memory fixed-window counter
//!
//! Standalone backend for single-instance deployments and the fallback when
//! the shared log is unreachable. Entries expire lazily on access; a periodic
//! sweeper clears buckets no request has touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::{hash_token, window_bucket, MetricCounters, RateDecision, RateLimiter, RateLimiterMetrics};

pub struct MemoryRateLimiter {
    window: Duration,
    max_requests: u64,
    /// hashed token -> (count, bucket)
    counters: DashMap<String, (u64, i64)>,
    metrics: MetricCounters,
}

impl MemoryRateLimiter {
    pub fn new(window: Duration, max_requests: u64) -> Arc<Self> {
        Arc::new(Self {
            window,
            max_requests,
            counters: DashMap::new(),
            metrics: MetricCounters::default(),
        })
    }

    /// Synchronous check used directly and from the redis fallback path.
    pub fn check(&self, token: &str) -> RateDecision {
        let window_secs = self.window.as_secs().max(1) as i64;
        let now = Utc::now();
        let (bucket, reset_at) = window_bucket(now, window_secs);
        let key = hash_token(token, None);

        let count = {
            let mut entry = self.counters.entry(key).or_insert((0, bucket));
            if entry.1 != bucket {
                // Lazy expiry: previous window's count is gone on first touch
                *entry = (0, bucket);
            }
            entry.0 += 1;
            entry.0
        };

        let decision = RateDecision {
            allowed: count <= self.max_requests,
            remaining: self.max_requests.saturating_sub(count),
            reset_at,
        };
        self.metrics.record(&decision);
        decision
    }

    /// Periodically clear buckets that lazy expiry never revisits.
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        let period = limiter.window.max(Duration::from_secs(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let window_secs = limiter.window.as_secs().max(1) as i64;
                let (current, _) = window_bucket(Utc::now(), window_secs);
                limiter.counters.retain(|_, (_, bucket)| *bucket >= current);
            }
        })
    }
}

#[async_trait]
impl RateLimiter for MemoryRateLimiter {
    async fn allow(&self, token: &str) -> RateDecision {
        self.check(token)
    }

    fn metrics(&self) -> RateLimiterMetrics {
        self.metrics.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60), 3);
        for i in 0..3 {
            let decision = limiter.allow("wt_token").await;
            assert!(decision.allowed, "request {i} within limit");
            assert_eq!(decision.remaining, 2 - i);
        }
        let denied = limiter.allow("wt_token").await;
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs() >= 1);
    }

    #[tokio::test]
    async fn tokens_are_counted_independently() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60), 1);
        assert!(limiter.allow("wt_a").await.allowed);
        assert!(!limiter.allow("wt_a").await.allowed);
        assert!(limiter.allow("wt_b").await.allowed);
    }

    #[tokio::test]
    async fn metrics_count_allowed_and_denied() {
        let limiter = MemoryRateLimiter::new(Duration::from_secs(60), 1);
        limiter.allow("wt_a").await;
        limiter.allow("wt_a").await;
        let metrics = limiter.metrics();
        assert_eq!(metrics.allowed, 1);
        assert_eq!(metrics.denied, 1);
    }

    #[tokio::test]
    async fn window_rollover_resets_count() {
        // 1-second window; simulate rollover by rewriting the stored bucket
        let limiter = MemoryRateLimiter::new(Duration::from_secs(1), 1);
        assert!(limiter.allow("wt_a").await.allowed);
        assert!(!limiter.allow("wt_a").await.allowed);

        for mut entry in limiter.counters.iter_mut() {
            entry.1 -= 1; // pretend the entry is from the previous bucket
        }
        assert!(limiter.allow("wt_a").await.allowed);
    }
}
