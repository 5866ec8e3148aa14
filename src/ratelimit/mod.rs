//! Per-token rate limiting
//!
//! Fixed-window counters behind one trait with two backends: the shared
//! key-value log for multi-instance deployments and an in-memory map used
//! standalone or as fallback when the shared log is unreachable. Under
//! concurrency the window may overshoot by up to (concurrency - 1); that is
//! accepted.
//!
//! Keys never contain the raw token: the token is hashed, keyed with a
//! server-side pepper when one is configured.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

mod memory;
mod redis;

pub use memory::MemoryRateLimiter;
pub use redis::RedisRateLimiter;

use crate::config::{LimiterErrorPolicy, RateLimitConfig};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub reset_at: DateTime<Utc>,
}

impl RateDecision {
    /// Seconds until the window resets, for the Retry-After header.
    pub fn retry_after_secs(&self) -> u64 {
        (self.reset_at - Utc::now()).num_seconds().max(1) as u64
    }
}

/// Counters exposed for scraping.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct RateLimiterMetrics {
    pub allowed: u64,
    pub denied: u64,
    pub backend_errors: u64,
    pub fallback_decisions: u64,
}

#[derive(Default)]
pub(crate) struct MetricCounters {
    allowed: AtomicU64,
    denied: AtomicU64,
    backend_errors: AtomicU64,
    fallback_decisions: AtomicU64,
}

impl MetricCounters {
    pub(crate) fn record(&self, decision: &RateDecision) {
        if decision.allowed {
            self.allowed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.denied.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_error(&self) {
        self.backend_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fallback(&self) {
        self.fallback_decisions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> RateLimiterMetrics {
        RateLimiterMetrics {
            allowed: self.allowed.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
            fallback_decisions: self.fallback_decisions.load(Ordering::Relaxed),
        }
    }
}

/// Sliding-window admission check. Backend failures never surface to the
/// caller; the configured policy decides between allow-with-warning and deny.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn allow(&self, token: &str) -> RateDecision;
    fn metrics(&self) -> RateLimiterMetrics;
}

/// Hash a token for use in shared-log keys. Keyed (HMAC) when a pepper is
/// configured, plain SHA-256 otherwise; truncated to 32 hex chars.
pub fn hash_token(token: &str, pepper: Option<&str>) -> String {
    let digest = match pepper {
        Some(pepper) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(pepper.as_bytes())
                .expect("hmac accepts any key length");
            mac.update(token.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        None => Sha256::digest(token.as_bytes()).to_vec(),
    };
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..32].to_string()
}

/// Fixed-window arithmetic shared by both backends.
pub(crate) fn window_bucket(now: DateTime<Utc>, window_secs: i64) -> (i64, DateTime<Utc>) {
    let bucket = now.timestamp().div_euclid(window_secs);
    let reset_at = DateTime::from_timestamp((bucket + 1) * window_secs, 0).unwrap_or(now);
    (bucket, reset_at)
}

/// Decide a deny-with-policy outcome when no counter is reachable.
pub(crate) fn policy_decision(
    policy: LimiterErrorPolicy,
    max_requests: u64,
    reset_at: DateTime<Utc>,
) -> RateDecision {
    match policy {
        LimiterErrorPolicy::Allow => RateDecision {
            allowed: true,
            remaining: max_requests,
            reset_at,
        },
        LimiterErrorPolicy::Deny => RateDecision {
            allowed: false,
            remaining: 0,
            reset_at,
        },
    }
}

/// Construct the limiter for the deployment: shared-log backed when a redis
/// connection exists, in-memory otherwise. Must run inside the runtime; the
/// in-memory windows get a background sweeper.
pub fn build(
    config: &RateLimitConfig,
    redis: Option<::redis::aio::ConnectionManager>,
) -> Arc<dyn RateLimiter> {
    match redis {
        Some(conn) => {
            let fallback = if config.fallback_to_memory {
                let memory = MemoryRateLimiter::new(config.window, config.max_requests);
                memory.spawn_sweeper();
                Some(memory)
            } else {
                None
            };
            Arc::new(RedisRateLimiter::new(config.clone(), conn, fallback))
        }
        None => {
            let memory = MemoryRateLimiter::new(config.window, config.max_requests);
            memory.spawn_sweeper();
            memory
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_token_free() {
        let token = "wt_secret-token-value";
        let a = hash_token(token, None);
        let b = hash_token(token, None);
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);
        assert!(!a.contains("secret"));
    }

    #[test]
    fn pepper_changes_hash() {
        let token = "wt_secret-token-value";
        assert_ne!(hash_token(token, None), hash_token(token, Some("pepper")));
        assert_ne!(
            hash_token(token, Some("pepper-a")),
            hash_token(token, Some("pepper-b"))
        );
    }

    #[test]
    fn bucket_and_reset() {
        let now = DateTime::from_timestamp(125, 0).unwrap();
        let (bucket, reset_at) = window_bucket(now, 60);
        assert_eq!(bucket, 2);
        assert_eq!(reset_at.timestamp(), 180);
    }

    #[test]
    fn policy_allow_vs_deny() {
        let reset_at = Utc::now();
        assert!(policy_decision(LimiterErrorPolicy::Allow, 10, reset_at).allowed);
        assert!(!policy_decision(LimiterErrorPolicy::Deny, 10, reset_at).allowed);
    }
}
