//! Generic last-used-timestamp cache: a key→value map paired with a
//! min-heap on last-used order, used for the EWF segment/table/chunk
//! caches. Eviction compares against a caller-supplied weight (a fixed
//! "one slot per entry" weight for the segment cache, the decoded table's
//! byte length for the table cache).
//!
//! The heap entries are lazily validated: an entry is stale once its
//! key's current last-used stamp no longer matches what's recorded in the
//! heap, so a stale pop is simply discarded rather than causing a
//! mis-eviction.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::hash::Hash;

struct Slot<V> {
    value: V,
    last_used: u64,
    weight: u64,
}

pub struct LruCache<K: Eq + Hash + Clone, V> {
    entries: HashMap<K, Slot<V>>,
    heap: BinaryHeap<Reverse<(u64, K)>>,
    clock: u64,
    max_weight: u64,
    current_weight: u64,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(max_weight: u64) -> Self {
        LruCache {
            entries: HashMap::new(),
            heap: BinaryHeap::new(),
            clock: 0,
            max_weight,
            current_weight: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let now = self.tick();
        if let Some(slot) = self.entries.get_mut(key) {
            slot.last_used = now;
            self.heap.push(Reverse((now, key.clone())));
            Some(&mut slot.value)
        } else {
            None
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Insert `value` under `key` with the given `weight`, evicting
    /// least-recently-used entries (other than `key` itself) until the
    /// total weight fits the budget. Returns the evicted values, in case
    /// the caller needs to release an associated resource (e.g. close a
    /// file handle).
    pub fn insert(&mut self, key: K, value: V, weight: u64) -> Vec<V> {
        let mut evicted = Vec::new();

        if let Some(old) = self.entries.remove(&key) {
            self.current_weight -= old.weight;
        }

        while self.current_weight + weight > self.max_weight && !self.entries.is_empty() {
            match self.evict_one(Some(&key)) {
                Some(v) => evicted.push(v),
                None => break,
            }
        }

        let now = self.tick();
        self.heap.push(Reverse((now, key.clone())));
        self.current_weight += weight;
        self.entries.insert(
            key,
            Slot {
                value,
                last_used: now,
                weight,
            },
        );
        evicted
    }

    fn evict_one(&mut self, protect: Option<&K>) -> Option<V> {
        while let Some(Reverse((ts, key))) = self.heap.pop() {
            if Some(&key) == protect {
                continue;
            }
            let Some(slot) = self.entries.get(&key) else {
                continue;
            };
            if slot.last_used != ts {
                continue;
            }
            let slot = self.entries.remove(&key).unwrap();
            self.current_weight -= slot.weight;
            return Some(slot.value);
        }
        None
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
    fn evicts_least_recently_used() {
        let mut cache: LruCache<u32, &'static str> = LruCache::new(2);
        assert!(cache.insert(1, "a", 1).is_empty());
        assert!(cache.insert(2, "b", 1).is_empty());
        // touch 1 so 2 becomes the LRU entry
        assert_eq!(cache.get_mut(&1), Some(&mut "a"));
        let evicted = cache.insert(3, "c", 1);
        assert_eq!(evicted, vec!["b"]);
        assert!(cache.contains(&1));
        assert!(!cache.contains(&2));
        assert!(cache.contains(&3));
    }

    #[test]
    fn byte_budget_eviction() {
        let mut cache: LruCache<u32, Vec<u8>> = LruCache::new(10);
        cache.insert(1, vec![0u8; 6], 6);
        let evicted = cache.insert(2, vec![0u8; 6], 6);
        assert_eq!(evicted.len(), 1);
        assert_eq!(cache.len(), 1);
    }
}
