//! Memoization for the per-request project-active check
//!
//! `is_project_active` runs on every proxied request; this caches the boolean
//! for a short TTL so the store only sees one probe per project per window.
//! Entries are dropped eagerly on project mutation by the admin layer.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

pub struct ActiveProjectCache {
    entries: DashMap<Uuid, (bool, Instant)>,
    capacity: usize,
    ttl: Duration,
}

impl ActiveProjectCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, project_id: Uuid) -> Option<bool> {
        let entry = self.entries.get(&project_id)?;
        let (active, stored_at) = *entry;
        if stored_at.elapsed() >= self.ttl {
            drop(entry);
            self.entries
                .remove_if(&project_id, |_, (_, at)| at.elapsed() >= self.ttl);
            return None;
        }
        Some(active)
    }

    pub fn insert(&self, project_id: Uuid, active: bool) {
        if self.entries.len() >= self.capacity {
            // Cheap pressure valve: drop expired entries, then start over
            self.entries.retain(|_, (_, at)| at.elapsed() < self.ttl);
            if self.entries.len() >= self.capacity {
                self.entries.clear();
            }
        }
        self.entries.insert(project_id, (active, Instant::now()));
    }

    /// Forget a project after a mutation so the next request re-reads the store.
    pub fn invalidate(&self, project_id: Uuid) {
        self.entries.remove(&project_id);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_within_ttl() {
        let cache = ActiveProjectCache::new(10, Duration::from_secs(60));
        let id = Uuid::new_v4();
        assert!(cache.get(id).is_none());
        cache.insert(id, true);
        assert_eq!(cache.get(id), Some(true));
    }

    #[test]
    fn expires_after_ttl() {
        let cache = ActiveProjectCache::new(10, Duration::ZERO);
        let id = Uuid::new_v4();
        cache.insert(id, true);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn invalidate_forces_reread() {
        let cache = ActiveProjectCache::new(10, Duration::from_secs(60));
        let id = Uuid::new_v4();
        cache.insert(id, false);
        cache.invalidate(id);
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn capacity_is_bounded() {
        let cache = ActiveProjectCache::new(4, Duration::from_secs(60));
        for _ in 0..20 {
            cache.insert(Uuid::new_v4(), true);
        }
        assert!(cache.len() <= 5);
    }
}
