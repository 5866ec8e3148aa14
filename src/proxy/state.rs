//! Proxy state types and per-request extensions

use std::sync::Arc;

use bytes::Bytes;

use crate::auth::{ActiveProjectCache, TokenCache};
use crate::bus::EventBus;
use crate::cache::HttpCache;
use crate::config::{Allowlist, Config};
use crate::dispatcher::Dispatcher;
use crate::ratelimit::RateLimiter;
use crate::stats::StatsAggregator;
use crate::store::TokenStore;

/// Shared state for the proxy server. Every field is a process-wide
/// singleton; per-request state travels in request extensions.
#[derive(Clone)]
pub struct ProxyState {
    /// Pooled HTTP client for upstream calls
    pub client: reqwest::Client,
    pub config: Arc<Config>,
    pub allowlist: Arc<Allowlist>,
    pub store: Arc<dyn TokenStore>,
    pub token_cache: Arc<TokenCache>,
    pub project_cache: Arc<ActiveProjectCache>,
    pub rate_limiter: Arc<dyn RateLimiter>,
    pub http_cache: Arc<HttpCache>,
    pub stats: Arc<StatsAggregator>,
    pub bus: Arc<dyn EventBus>,
    pub dispatcher: Arc<Dispatcher>,
}

/// Correlation id for one request; mirrored to the response.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Request body buffered by the instrumentation middleware. Downstream
/// stages (cache key hashing, upstream forward) reuse these bytes instead of
/// re-reading the body.
#[derive(Debug, Clone)]
pub struct BufferedBody(pub Bytes);
