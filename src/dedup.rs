// Copyright 2025 Cowboy AI, LLC.

//! Bounded duplicate-suppression cache for inbound events
//!
//! Entries are evicted oldest-inserted first. Lookups go through
//! [`LruCache::contains`], which does not touch recency, so the LRU order is
//! exactly insertion order. Nothing is persisted: a restart forgets every
//! entry.

use lru::LruCache;
use std::num::NonZeroUsize;

use crate::events::EventId;

/// Default number of event ids remembered per dispatcher
pub const DEFAULT_DEDUP_CAPACITY: usize = 10_000;

/// Insertion-order-evicting set of recently dispatched event ids
#[derive(Debug)]
pub struct DedupCache {
    seen: LruCache<EventId, ()>,
}

impl DedupCache {
    /// Create a cache remembering at most `capacity` ids (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            seen: LruCache::new(capacity),
        }
    }

    /// Whether the id was recorded and has not been evicted
    pub fn contains(&self, event_id: &EventId) -> bool {
        self.seen.contains(event_id)
    }

    /// Record an id. Returns `false` if it was already present.
    ///
    /// Past capacity the oldest recorded id is evicted.
    pub fn insert(&mut self, event_id: EventId) -> bool {
        if self.seen.contains(&event_id) {
            return false;
        }
        self.seen.push(event_id, ());
        true
    }

    /// Number of ids currently remembered
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no ids are remembered
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Maximum number of ids remembered
    pub fn capacity(&self) -> usize {
        self.seen.cap().get()
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_insert_reports_duplicates() {
        let mut cache = DedupCache::new(4);
        let id = EventId::new();

        assert!(cache.insert(id));
        assert!(!cache.insert(id));
        assert!(cache.contains(&id));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_plus_one_evicts_first_inserted() {
        let capacity = 8;
        let mut cache = DedupCache::new(capacity);
        let ids: Vec<EventId> = (0..=capacity).map(|_| EventId::new()).collect();

        for id in &ids {
            cache.insert(*id);
        }

        assert_eq!(cache.len(), capacity);
        assert!(!cache.contains(&ids[0]));
        for id in &ids[1..] {
            assert!(cache.contains(id));
        }
    }

    #[test]
    fn test_lookup_does_not_refresh_entry() {
        let mut cache = DedupCache::new(2);
        let first = EventId::new();
        let second = EventId::new();
        let third = EventId::new();

        cache.insert(first);
        cache.insert(second);
        // A duplicate hit must not move `first` to the back of the queue.
        assert!(!cache.insert(first));
        assert!(cache.contains(&first));
        cache.insert(third);

        assert!(!cache.contains(&first));
        assert!(cache.contains(&second));
        assert!(cache.contains(&third));
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache = DedupCache::new(0);
        assert_eq!(cache.capacity(), 1);
        assert!(cache.is_empty());
    }

    proptest! {
        #[test]
        fn prop_size_never_exceeds_capacity(capacity in 1usize..64, inserts in 0usize..200) {
            let mut cache = DedupCache::new(capacity);
            for _ in 0..inserts {
                cache.insert(EventId::new());
                prop_assert!(cache.len() <= capacity);
            }
        }
    }
}
