//! Concurrent index from key to storage slot.
//!
//! Backed by `crossbeam-skiplist::SkipMap`, the same lock-free structure the
//! memtables of LSM engines use. Insert-if-absent is linearizable: concurrent
//! callers racing on one key all get the entry that won. Slots are never
//! removed for the lifetime of the process; a deletion is an empty value.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_skiplist::SkipMap;

use crate::slot::Slot;

pub struct Index {
    map: SkipMap<Vec<u8>, Arc<Slot>>,
    next_slot_id: AtomicU64,
}

impl Index {
    pub fn new() -> Self {
        Self {
            map: SkipMap::new(),
            next_slot_id: AtomicU64::new(0),
        }
    }

    pub fn find(&self, key: &[u8]) -> Option<Arc<Slot>> {
        self.map.get(key).map(|entry| entry.value().clone())
    }

    /// Returns the unique slot for `key`, creating an empty one if absent.
    pub fn get_or_insert(&self, key: &[u8]) -> Arc<Slot> {
        if let Some(slot) = self.find(key) {
            return slot;
        }
        let entry = self.map.get_or_insert_with(key.to_vec(), || {
            Arc::new(Slot::new(self.next_slot_id.fetch_add(1, Ordering::Relaxed)))
        });
        entry.value().clone()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

impl Default for Index {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::thread;

    #[test]
    fn test_find_missing_key() {
        let index = Index::new();
        assert!(index.find(b"alice").is_none());
        assert!(index.is_empty());
    }

    #[test]
    fn test_get_or_insert_returns_same_slot() {
        let index = Index::new();
        let first = index.get_or_insert(b"alice");
        let second = index.get_or_insert(b"alice");
        let other = index.get_or_insert(b"bob");

        assert!(Arc::ptr_eq(&first, &second));
        assert_ne!(first.id(), other.id());
        assert_eq!(index.len(), 2);
        assert!(Arc::ptr_eq(&index.find(b"alice").unwrap(), &first));
    }

    #[test]
    fn test_concurrent_inserts_resolve_to_one_slot() {
        let index = Arc::new(Index::new());
        let mut handles = Vec::new();

        for _ in 0..8 {
            let index = index.clone();
            handles.push(thread::spawn(move || {
                (0..100)
                    .map(|i| index.get_or_insert(format!("key{}", i).as_bytes()).id())
                    .collect::<Vec<_>>()
            }));
        }

        let results: Vec<Vec<u64>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for ids in &results[1..] {
            assert_eq!(ids, &results[0], "every thread must see the same slots");
        }
        assert_eq!(index.len(), 100);
        let unique: HashSet<_> = results[0].iter().collect();
        assert_eq!(unique.len(), 100);
    }
}
