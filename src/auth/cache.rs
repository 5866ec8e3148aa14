//! Hot-path token validation cache
//!
//! A capacity-bounded map from token string to validation outcome. Reads take
//! a shared lock and bump an atomic access stamp; eviction pops a min-heap
//! keyed on those stamps, lazily repairing entries whose stamp moved since
//! they were pushed, so evicting the least-recently-used entry is O(log N)
//! with no scans on the hot path.
//!
//! A cached entry may lag server-side state: revocation must invalidate
//! explicitly (the admin layer does), while the token's own expiry is
//! re-checked by the caller on every hit.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Validation outcome stored per token string.
#[derive(Debug, Clone)]
pub struct CachedToken {
    pub token_id: Uuid,
    pub project_id: Uuid,
    pub expires_at: Option<DateTime<Utc>>,
    pub cached_at: Instant,
    /// Entry lifetime: min(configured TTL, token remaining lifetime)
    pub ttl: Duration,
}

struct Entry {
    value: CachedToken,
    stamp: Arc<AtomicU64>,
}

/// Counters exposed for scraping.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct TokenCacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub size: usize,
}

pub struct TokenCache {
    capacity: usize,
    default_ttl: Duration,
    map: RwLock<HashMap<String, Entry>>,
    /// Min-heap of (access stamp, token); stale stamps repaired on pop
    heap: Mutex<BinaryHeap<Reverse<(u64, String)>>>,
    clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl TokenCache {
    pub fn new(capacity: usize, default_ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            default_ttl,
            map: RwLock::new(HashMap::new()),
            heap: Mutex::new(BinaryHeap::new()),
            clock: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Look up a token. Returns the cached outcome even when the token itself
    /// has expired; the caller re-checks `expires_at` on every hit. Returns
    /// None once the cache entry's own TTL has lapsed.
    pub fn lookup(&self, token: &str) -> Option<CachedToken> {
        let expired = {
            let map = self.map.read().ok()?;
            match map.get(token) {
                Some(entry) => {
                    if entry.value.cached_at.elapsed() >= entry.value.ttl {
                        true
                    } else {
                        entry.stamp.store(self.tick(), Ordering::Relaxed);
                        self.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.value.clone());
                    }
                }
                None => {
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
            }
        };

        if expired {
            if let Ok(mut map) = self.map.write() {
                if let Some(entry) = map.get(token) {
                    if entry.value.cached_at.elapsed() >= entry.value.ttl {
                        map.remove(token);
                    }
                }
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Insert a validation outcome. The entry TTL is capped by the token's
    /// remaining lifetime so a cached token can never outlive itself.
    pub fn store(&self, token: String, token_id: Uuid, project_id: Uuid, expires_at: Option<DateTime<Utc>>) {
        let ttl = match expires_at {
            Some(exp) => {
                let remaining = (exp - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                self.default_ttl.min(remaining)
            }
            None => self.default_ttl,
        };
        if ttl.is_zero() {
            return;
        }

        let stamp = self.tick();
        let value = CachedToken {
            token_id,
            project_id,
            expires_at,
            cached_at: Instant::now(),
            ttl,
        };

        let Ok(mut map) = self.map.write() else {
            return;
        };
        map.insert(
            token.clone(),
            Entry {
                value,
                stamp: Arc::new(AtomicU64::new(stamp)),
            },
        );
        if let Ok(mut heap) = self.heap.lock() {
            heap.push(Reverse((stamp, token)));
            while map.len() > self.capacity {
                if !Self::evict_one(&mut map, &mut heap) {
                    break;
                }
                self.evictions.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Pop heap entries until one matches a live entry's current stamp, then
    /// remove that entry. Stale stamps are pushed back repaired.
    fn evict_one(
        map: &mut HashMap<String, Entry>,
        heap: &mut BinaryHeap<Reverse<(u64, String)>>,
    ) -> bool {
        while let Some(Reverse((stamp, token))) = heap.pop() {
            match map.get(&token) {
                None => continue, // removed or invalidated since pushed
                Some(entry) => {
                    let current = entry.stamp.load(Ordering::Relaxed);
                    if current != stamp {
                        heap.push(Reverse((current, token)));
                        continue;
                    }
                    map.remove(&token);
                    return true;
                }
            }
        }
        false
    }

    /// Drop one token's entry; called at the revocation site.
    pub fn invalidate(&self, token: &str) {
        if let Ok(mut map) = self.map.write() {
            if map.remove(token).is_some() {
                self.invalidations.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Drop every entry belonging to a project; called on project mutation.
    pub fn invalidate_project(&self, project_id: Uuid) {
        if let Ok(mut map) = self.map.write() {
            let before = map.len();
            map.retain(|_, entry| entry.value.project_id != project_id);
            let removed = (before - map.len()) as u64;
            if removed > 0 {
                self.invalidations.fetch_add(removed, Ordering::Relaxed);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> TokenCacheMetrics {
        TokenCacheMetrics {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            size: self.len(),
        }
    }
}
