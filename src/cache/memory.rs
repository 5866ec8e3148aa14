//! In-memory cache backend using DashMap with TTL expiry and capacity limits.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;

use super::backend::{CacheBackend, CachedResponse};

/// How often to run cleanup (every N operations).
const CLEANUP_INTERVAL: u64 = 1000;

pub struct InMemoryCacheBackend {
    entries: DashMap<String, CachedResponse>,
    max_entries: usize,
    op_count: AtomicU64,
}

impl InMemoryCacheBackend {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries: max_entries.max(1),
            op_count: AtomicU64::new(0),
        }
    }

    fn maybe_cleanup(&self) {
        let count = self.op_count.fetch_add(1, Ordering::Relaxed);
        if count > 0 && count % CLEANUP_INTERVAL == 0 {
            self.cleanup_expired();
        }
    }

    fn cleanup_expired(&self) {
        let now = Utc::now();
        self.entries.retain(|_, entry| entry.is_fresh(now));
    }

    fn evict_if_full(&self) {
        if self.entries.len() < self.max_entries {
            return;
        }

        self.cleanup_expired();
        if self.entries.len() < self.max_entries {
            return;
        }

        // Evict the oldest entry
        let oldest_key = self
            .entries
            .iter()
            .min_by_key(|entry| entry.value().stored_at)
            .map(|entry| entry.key().clone());
        if let Some(key) = oldest_key {
            self.entries.remove(&key);
        }
    }
}

#[async_trait]
impl CacheBackend for InMemoryCacheBackend {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        self.maybe_cleanup();

        let now = Utc::now();
        let result = self
            .entries
            .get(key)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| entry.value().clone());

        if result.is_none() {
            // Remove an expired entry on access
            self.entries
                .remove_if(key, |_, entry| !entry.is_fresh(now));
        }
        result
    }

    async fn set(&self, key: &str, response: CachedResponse) {
        self.maybe_cleanup();
        self.evict_if_full();
        self.entries.insert(key.to_string(), response);
    }

    async fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    async fn purge_prefix(&self, prefix: &str) -> u64 {
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(prefix));
        (before - self.entries.len()) as u64
    }

    async fn purge_all(&self) -> u64 {
        let count = self.entries.len() as u64;
        self.entries.clear();
        count
    }
}
