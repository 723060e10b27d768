//! A bounded cache whose entries also expire after a maximum age.
//!
//! The cache is owned by exactly one task (the event loop), so it carries no locks. Time is passed in explicitly,
//! which keeps expiry deterministic under test.

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

pub struct TtlCache<K: Hash + Eq, V> {
    entries: LruCache<K, (Instant, V)>,
    max_age: Option<Duration>,
}

impl<K: Hash + Eq, V> TtlCache<K, V> {
    /// A cache holding at most `max_items` entries (at least one), each living at most `max_age`.
    pub fn new(max_items: usize, max_age: Option<Duration>) -> Self {
        let cap = NonZeroUsize::new(max_items).unwrap_or(NonZeroUsize::MIN);
        TtlCache { entries: LruCache::new(cap), max_age }
    }

    /// Insert a value, evicting the least recently used entry when full. Returns the replaced value, if any.
    pub fn insert(&mut self, key: K, value: V, now: Instant) -> Option<V> {
        self.entries.put(key, (now, value)).map(|(_, v)| v)
    }

    pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
        if self.is_expired(key, now) {
            self.entries.pop(key);
            return None;
        }
        self.entries.get(key).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, key: &K, now: Instant) -> Option<&mut V> {
        if self.is_expired(key, now) {
            self.entries.pop(key);
            return None;
        }
        self.entries.get_mut(key).map(|(_, v)| v)
    }

    pub fn contains(&mut self, key: &K, now: Instant) -> bool {
        self.get(key, now).is_some()
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.pop(key).map(|(_, v)| v)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning them least recently used first.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let Some(max_age) = self.max_age else {
            return Vec::new();
        };
        let stale = |inserted: &Instant| now.saturating_duration_since(*inserted) > max_age;
        if !self.entries.iter().any(|(_, (inserted, _))| stale(inserted)) {
            return Vec::new();
        }
        let mut expired = Vec::new();
        let mut keep = LruCache::new(self.entries.cap());
        while let Some((k, (inserted, v))) = self.entries.pop_lru() {
            if stale(&inserted) {
                expired.push((k, v));
            } else {
                keep.put(k, (inserted, v));
            }
        }
        self.entries = keep;
        expired
    }

    fn is_expired(&self, key: &K, now: Instant) -> bool {
        match (self.max_age, self.entries.peek(key)) {
            (Some(max_age), Some((inserted, _))) => now.saturating_duration_since(*inserted) > max_age,
            _ => false,
        }
    }
}
