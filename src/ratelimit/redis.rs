//! Shared-log fixed-window counter
//!
//! One INCR per request against `{prefix}:{hashed-token}:{bucket}`; the key
//! expires after two windows so stale buckets clean themselves up. When the
//! shared log errors, the in-memory fallback takes over if enabled, otherwise
//! the configured policy decides.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;

use super::{
    hash_token, policy_decision, window_bucket, MemoryRateLimiter, MetricCounters, RateDecision,
    RateLimiter, RateLimiterMetrics,
};
use crate::config::RateLimitConfig;

pub struct RedisRateLimiter {
    config: RateLimitConfig,
    conn: ConnectionManager,
    fallback: Option<Arc<MemoryRateLimiter>>,
    metrics: MetricCounters,
}

impl RedisRateLimiter {
    pub fn new(
        config: RateLimitConfig,
        conn: ConnectionManager,
        fallback: Option<Arc<MemoryRateLimiter>>,
    ) -> Self {
        Self {
            config,
            conn,
            fallback,
            metrics: MetricCounters::default(),
        }
    }

    async fn try_increment(&self, key: &str, window_secs: i64) -> redis::RedisResult<u64> {
        let mut conn = self.conn.clone();
        let count: u64 = conn.incr(key, 1u64).await?;
        if count == 1 {
            // Expiry set on first write only: 2x the window covers the tail
            let _: i64 = conn.expire(key, window_secs * 2).await?;
        }
        Ok(count)
    }
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    async fn allow(&self, token: &str) -> RateDecision {
        let window_secs = self.config.window.as_secs().max(1) as i64;
        let (bucket, reset_at) = window_bucket(Utc::now(), window_secs);
        let hashed = hash_token(token, self.config.pepper.as_deref());
        let key = format!("{}:{}:{}", self.config.key_prefix, hashed, bucket);

        match self.try_increment(&key, window_secs).await {
            Ok(count) => {
                let decision = RateDecision {
                    allowed: count <= self.config.max_requests,
                    remaining: self.config.max_requests.saturating_sub(count),
                    reset_at,
                };
                self.metrics.record(&decision);
                decision
            }
            Err(err) => {
                self.metrics.record_error();
                match &self.fallback {
                    Some(fallback) => {
                        tracing::warn!(error = %err, "Shared log unreachable, using in-memory rate limit");
                        self.metrics.record_fallback();
                        fallback.check(token)
                    }
                    None => {
                        tracing::warn!(
                            error = %err,
                            policy = ?self.config.on_error,
                            "Shared log unreachable and fallback disabled"
                        );
                        let decision = policy_decision(
                            self.config.on_error,
                            self.config.max_requests,
                            reset_at,
                        );
                        self.metrics.record(&decision);
                        decision
                    }
                }
            }
        }
    }

    fn metrics(&self) -> RateLimiterMetrics {
        self.metrics.snapshot()
    }
}
