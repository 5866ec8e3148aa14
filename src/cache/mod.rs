//! HTTP response cache
//!
//! Read-through/write-through cache keyed per project. The key never includes
//! the Authorization header; two tokens of the same project share entries.
//! Cacheability follows the upstream's Cache-Control with one deliberate
//! extension: POST responses are cacheable only when the *request* carries
//! `Cache-Control: public` (explicit opt-in, non-standard).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderMap, Method};
use bytes::Bytes;
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

mod backend;
mod memory;
mod redis;

pub use backend::{CacheBackend, CachedResponse};
pub use memory::InMemoryCacheBackend;
pub use redis::RedisCacheBackend;

use crate::config::{CacheBackendKind, CacheConfig};
use crate::util::canonicalize_query;

/// Request headers folded into the key (conservative Vary subset).
const VARY_HEADERS: [header::HeaderName; 3] = [
    header::ACCEPT,
    header::ACCEPT_ENCODING,
    header::ACCEPT_LANGUAGE,
];

/// Response headers never stored or replayed.
fn is_uncacheable_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct HttpCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub size_rejections: u64,
    pub capture_overflows: u64,
    pub purged: u64,
}

pub struct HttpCache {
    config: CacheConfig,
    backend: Arc<dyn CacheBackend>,
    /// Per-key guards for the single-flight path
    inflight: Arc<DashMap<String, Arc<Mutex<()>>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    size_rejections: AtomicU64,
    capture_overflows: AtomicU64,
    purged: AtomicU64,
}

/// Holds a per-key single-flight slot; releases it on drop.
pub struct FlightGuard {
    map: Arc<DashMap<String, Arc<Mutex<()>>>>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        // Drop the map entry once no other task is waiting on this key.
        // The guard itself holds one Arc clone, the map another.
        self.map
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) <= 2);
    }
}

impl HttpCache {
    pub fn new(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            config,
            backend,
            inflight: Arc::new(DashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            size_rejections: AtomicU64::new(0),
            capture_overflows: AtomicU64::new(0),
            purged: AtomicU64::new(0),
        }
    }

    /// Pick the backend for the configured deployment.
    pub fn build_backend(
        config: &CacheConfig,
        redis: Option<::redis::aio::ConnectionManager>,
    ) -> Arc<dyn CacheBackend> {
        match (config.backend, redis) {
            (CacheBackendKind::Redis, Some(conn)) => {
                Arc::new(RedisCacheBackend::new(conn, config.key_prefix.clone()))
            }
            (CacheBackendKind::Redis, None) => {
                tracing::warn!("Cache backend 'redis' configured without redis_url, using memory");
                Arc::new(InMemoryCacheBackend::new(config.max_entries))
            }
            (CacheBackendKind::Memory, _) => {
                Arc::new(InMemoryCacheBackend::new(config.max_entries))
            }
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn max_object_bytes(&self) -> usize {
        self.config.max_object_bytes
    }

    /// Deterministic cache key.
    ///
    /// `{prefix}:{project}:{digest}` where the digest covers method, path,
    /// canonicalized query, the Vary-subset request header values, and for
    /// POST a hash of the request body. Keeping the project id in clear makes
    /// per-project purges a prefix operation.
    pub fn derive_key(
        &self,
        project_id: Uuid,
        method: &Method,
        path: &str,
        raw_query: &str,
        headers: &HeaderMap,
        body: &[u8],
    ) -> String {
        let mut hasher = Sha256::new();
        hasher.update(method.as_str().as_bytes());
        hasher.update(b"|");
        hasher.update(path.as_bytes());
        hasher.update(b"|");
        hasher.update(canonicalize_query(raw_query).as_bytes());
        for name in &VARY_HEADERS {
            hasher.update(b"|");
            if let Some(value) = headers.get(name) {
                hasher.update(value.as_bytes());
            }
        }
        if method == Method::POST {
            hasher.update(b"|");
            hasher.update(Sha256::digest(body));
        }
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        format!("{}:{}:{}", self.config.key_prefix, project_id, &hex[..40])
    }

    /// Short key hash for the debug response header.
    pub fn key_display(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        digest.iter().take(8).map(|b| format!("{b:02x}")).collect()
    }

    /// Is the request eligible for caching at all?
    pub fn request_cacheable(&self, method: &Method, headers: &HeaderMap) -> bool {
        if !self.config.enabled {
            return false;
        }
        match *method {
            Method::GET | Method::HEAD => true,
            // POST caching is explicit opt-in on the request
            Method::POST => directives(headers).iter().any(|d| d == "public"),
            _ => false,
        }
    }

    /// Does the upstream response permit storing?
    pub fn response_cacheable(&self, status: u16, headers: &HeaderMap) -> bool {
        if !(200..300).contains(&status) {
            return false;
        }
        !directives(headers)
            .iter()
            .any(|d| d == "no-store" || d == "private" || d == "no-cache")
    }

    /// TTL precedence: `s-maxage` > `max-age` > configured default.
    pub fn ttl_for(&self, headers: &HeaderMap) -> Duration {
        let directives = directives(headers);
        for prefix in ["s-maxage=", "max-age="] {
            for directive in &directives {
                if let Some(value) = directive.strip_prefix(prefix) {
                    if let Ok(secs) = value.trim().parse::<u64>() {
                        return Duration::from_secs(secs);
                    }
                }
            }
        }
        self.config.default_ttl
    }

    pub async fn lookup(&self, key: &str) -> Option<CachedResponse> {
        let entry = self.backend.get(key).await;
        match &entry {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        entry
    }

    /// Store a response body captured in full. Size cap and response
    /// directives are enforced here; oversized bodies are rejected with a
    /// counter bump.
    pub async fn store(
        &self,
        key: &str,
        status: u16,
        response_headers: &HeaderMap,
        body: Bytes,
    ) {
        if !self.response_cacheable(status, response_headers) {
            return;
        }
        if body.len() > self.config.max_object_bytes {
            self.size_rejections.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let headers = response_headers
            .iter()
            .filter(|(name, _)| !is_uncacheable_header(name.as_str()))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let now = Utc::now();
        let ttl = self.ttl_for(response_headers);
        let entry = CachedResponse {
            status,
            headers,
            body,
            stored_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()),
        };
        self.backend.set(key, entry).await;
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    /// Note a streaming capture that outgrew the cap and was discarded.
    pub fn record_capture_overflow(&self) {
        self.capture_overflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Acquire the single-flight slot for a key. Used on buffered misses to
    /// collapse a thundering herd; callers re-check the cache after acquiring.
    pub async fn begin_flight(&self, key: &str) -> FlightGuard {
        let mutex = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = mutex.lock_owned().await;
        FlightGuard {
            map: Arc::clone(&self.inflight),
            key: key.to_string(),
            _guard: guard,
        }
    }

    pub async fn purge_key(&self, key: &str) -> bool {
        let removed = self.backend.delete(key).await;
        if removed {
            self.purged.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    pub async fn purge_prefix(&self, prefix: &str) -> u64 {
        let removed = self.backend.purge_prefix(prefix).await;
        self.purged.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    pub async fn purge_all(&self) -> u64 {
        let removed = self.backend.purge_all().await;
        self.purged.fetch_add(removed, Ordering::Relaxed);
        removed
    }

    /// Prefix covering one project's entries.
    pub fn project_prefix(&self, project_id: Uuid) -> String {
        format!("{}:{}", self.config.key_prefix, project_id)
    }

    pub fn metrics(&self) -> HttpCacheMetrics {
        HttpCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            size_rejections: self.size_rejections.load(Ordering::Relaxed),
            capture_overflows: self.capture_overflows.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Lowercased Cache-Control directives from a header map.
fn directives(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|d| d.trim().to_ascii_lowercase())
        .collect()
}
