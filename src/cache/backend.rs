//! Cache storage backends
//!
//! The entry format is shared by both backends; the redis backend ships it as
//! JSON with the body base64-encoded. Backend failures are logged and read as
//! misses; a broken cache must never fail a request.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A cached upstream response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    /// Response headers minus hop-by-hop and length framing
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_encoding")]
    pub body: Bytes,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Fetch a fresh entry; expired entries read as misses.
    async fn get(&self, key: &str) -> Option<CachedResponse>;
    /// Atomic single write; last writer wins.
    async fn set(&self, key: &str, response: CachedResponse);
    async fn delete(&self, key: &str) -> bool;
    /// Remove every key starting with `prefix`; returns entries removed.
    async fn purge_prefix(&self, prefix: &str) -> u64;
    async fn purge_all(&self) -> u64;
}

mod body_encoding {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
