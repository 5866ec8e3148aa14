//! Redis cache backend
//!
//! Entries are stored as JSON strings under their full cache key with the
//! remaining TTL as the redis expiry, so redis evicts on schedule without a
//! sweeper. Prefix and full purges walk the keyspace with SCAN.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::backend::{CacheBackend, CachedResponse};

pub struct RedisCacheBackend {
    conn: ConnectionManager,
    /// Configured key prefix; the scope of `purge_all`
    root_prefix: String,
}

impl RedisCacheBackend {
    pub fn new(conn: ConnectionManager, root_prefix: String) -> Self {
        Self { conn, root_prefix }
    }

    async fn delete_matching(&self, pattern: &str) -> u64 {
        let mut scan_conn = self.conn.clone();
        let keys: Vec<String> = {
            let mut iter = match scan_conn.scan_match::<_, String>(pattern).await {
                Ok(iter) => iter,
                Err(err) => {
                    tracing::warn!(error = %err, pattern, "Cache purge scan failed");
                    return 0;
                }
            };
            let mut keys = Vec::new();
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
            keys
        };

        if keys.is_empty() {
            return 0;
        }
        let mut conn = self.conn.clone();
        match conn.del::<_, u64>(keys).await {
            Ok(removed) => removed,
            Err(err) => {
                tracing::warn!(error = %err, pattern, "Cache purge delete failed");
                0
            }
        }
    }
}

#[async_trait]
impl CacheBackend for RedisCacheBackend {
    async fn get(&self, key: &str) -> Option<CachedResponse> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = match conn.get(key).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "Cache read failed, treating as miss");
                return None;
            }
        };
        let entry: CachedResponse = serde_json::from_str(&raw?).ok()?;
        entry.is_fresh(Utc::now()).then_some(entry)
    }

    async fn set(&self, key: &str, response: CachedResponse) {
        let ttl = (response.expires_at - Utc::now()).num_seconds();
        if ttl <= 0 {
            return;
        }
        let raw = match serde_json::to_string(&response) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "Cache entry serialization failed");
                return;
            }
        };
        let mut conn = self.conn.clone();
        if let Err(err) = conn.set_ex::<_, _, ()>(key, raw, ttl as u64).await {
            tracing::warn!(error = %err, "Cache write failed");
        }
    }

    async fn delete(&self, key: &str) -> bool {
        let mut conn = self.conn.clone();
        match conn.del::<_, u64>(key).await {
            Ok(removed) => removed > 0,
            Err(err) => {
                tracing::warn!(error = %err, "Cache delete failed");
                false
            }
        }
    }

    async fn purge_prefix(&self, prefix: &str) -> u64 {
        self.delete_matching(&format!("{prefix}*")).await
    }

    async fn purge_all(&self) -> u64 {
        self.delete_matching(&format!("{}*", self.root_prefix)).await
    }
}
