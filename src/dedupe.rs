// src/dedupe.rs
// Bounded, TTL-expiring duplicate-message cache (C5). Expiry is lazy:
// entries are only swept when the cache is touched, never on a background
// timer. When insertion would exceed capacity, the oldest 10% of entries
// (by insertion time) are evicted to make room.

use std::collections::HashMap;
use std::time::{Duration, Instant};

pub struct DedupeCache {
    ttl: Duration,
    capacity: usize,
    entries: HashMap<String, Instant>,
}

impl DedupeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        DedupeCache { ttl, capacity, entries: HashMap::new() }
    }

    fn sweep_expired(&mut self) {
        let ttl = self.ttl;
        let now = Instant::now();
        self.entries.retain(|_, inserted_at| now.duration_since(*inserted_at) < ttl);
    }

    fn evict_oldest_tenth(&mut self) {
        if self.entries.len() < self.capacity {
            return;
        }
        let evict_count = (self.capacity / 10).max(1);
        let mut by_age: Vec<(String, Instant)> =
            self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        by_age.sort_by_key(|(_, inserted_at)| *inserted_at);
        for (key, _) in by_age.into_iter().take(evict_count) {
            self.entries.remove(&key);
        }
    }

    /// Returns `true` if `message_id` is already present (and not expired).
    /// Sweeps expired entries as a side effect.
    pub fn is_duplicate(&mut self, message_id: &str) -> bool {
        self.sweep_expired();
        self.entries.contains_key(message_id)
    }

    /// Records `message_id` as seen, evicting the oldest 10% first if the
    /// cache is at capacity.
    pub fn add(&mut self, message_id: &str) {
        self.sweep_expired();
        self.evict_oldest_tenth();
        self.entries.insert(message_id.to_string(), Instant::now());
    }

    /// Atomically checks and records in one call: returns `true` if
    /// `message_id` was already present, otherwise records it and returns
    /// `false`. This is the entry point the receive pipeline uses so that
    /// a duplicate check never races its own insert.
    pub fn check_and_add(&mut self, message_id: &str) -> bool {
        if self.is_duplicate(message_id) {
            return true;
        }
        self.add(message_id);
        false
    }

    pub fn remove(&mut self, message_id: &str) {
        self.entries.remove(message_id);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&mut self) -> usize {
        self.sweep_expired();
        self.entries.len()
    }

    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_and_add_detects_duplicate() {
        let mut cache = DedupeCache::new(Duration::from_secs(60), 100);
        assert!(!cache.check_and_add("msg-1"));
        assert!(cache.check_and_add("msg-1"));
    }

    #[test]
    fn expired_entries_are_not_duplicates() {
        let mut cache = DedupeCache::new(Duration::from_millis(10), 100);
        cache.add("msg-1");
        std::thread::sleep(Duration::from_millis(30));
        assert!(!cache.is_duplicate("msg-1"));
    }

    #[test]
    fn capacity_eviction_drops_oldest_first() {
        let mut cache = DedupeCache::new(Duration::from_secs(3600), 10);
        for i in 0..10 {
            cache.add(&format!("msg-{i}"));
            std::thread::sleep(Duration::from_millis(2));
        }
        // cache is now at capacity; next add evicts the oldest entry (msg-0)
        cache.add("msg-10");
        assert!(cache.is_duplicate("msg-9"));
        assert!(!cache.is_duplicate("msg-0"));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = DedupeCache::new(Duration::from_secs(60), 100);
        cache.add("msg-1");
        cache.remove("msg-1");
        assert!(!cache.is_duplicate("msg-1"));

        cache.add("msg-2");
        cache.add("msg-3");
        cache.clear();
        assert!(cache.is_empty());
    }
}
