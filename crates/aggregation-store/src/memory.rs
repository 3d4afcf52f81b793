//! Volatile in-process store.
//!
//! Backed by a `BTreeMap` so scans come out in key order. Nothing survives a
//! restart; use it only when crash recovery is not required. A bounded store
//! either rejects writes that would exceed its capacity or evicts the least
//! recently written keys, depending on its [`Eviction`] policy.

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::batch::{BatchOp, WriteBatch};
use crate::traits::{Entry, KeyValueStore};
use crate::{StoreError, StoreResult};

/// What a bounded [`MemoryStore`] does when a write would exceed capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eviction {
    /// Fail the write with [`StoreError::CapacityExceeded`].
    Reject,
    /// Drop the least recently written keys until the store fits.
    LeastRecentlyWritten,
}

#[derive(Debug)]
struct Slot {
    value: Vec<u8>,
    seq: u64,
}

#[derive(Debug, Default)]
struct Inner {
    entries: BTreeMap<Vec<u8>, Slot>,
    /// Write sequence -> key, oldest first.
    write_order: BTreeMap<u64, Vec<u8>>,
    next_seq: u64,
}

impl Inner {
    fn insert(&mut self, key: Vec<u8>, value: Vec<u8>) {
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(old) = self.entries.insert(key.clone(), Slot { value, seq }) {
            self.write_order.remove(&old.seq);
        }
        self.write_order.insert(seq, key);
    }

    fn remove(&mut self, key: &[u8]) -> bool {
        match self.entries.remove(key) {
            Some(slot) => {
                self.write_order.remove(&slot.seq);
                true
            }
            None => false,
        }
    }

    fn evict_to(&mut self, capacity: usize) -> usize {
        let mut evicted = 0;
        while self.entries.len() > capacity {
            let Some((_, key)) = self.write_order.pop_first() else {
                break;
            };
            self.entries.remove(&key);
            evicted += 1;
        }
        evicted
    }

    /// Number of entries after applying `ops`, without applying them.
    fn projected_len(&self, ops: &[BatchOp]) -> usize {
        let mut last_write: HashMap<&[u8], bool> = HashMap::new();
        for op in ops {
            let present = matches!(op, BatchOp::Put { .. });
            last_write.insert(op.key(), present);
        }

        let mut len = self.entries.len();
        for (key, present) in last_write {
            match (self.entries.contains_key(key), present) {
                (false, true) => len += 1,
                (true, false) => len -= 1,
                _ => {}
            }
        }
        len
    }
}

/// Volatile ordered store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
    open: AtomicBool,
    capacity: Option<NonZeroUsize>,
    eviction: Eviction,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an unbounded store. Call [`KeyValueStore::open`] before use.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            open: AtomicBool::new(false),
            capacity: None,
            eviction: Eviction::Reject,
        }
    }

    /// Creates a store holding at most `capacity` entries.
    pub fn bounded(capacity: NonZeroUsize, eviction: Eviction) -> Self {
        Self {
            capacity: Some(capacity),
            eviction,
            ..Self::new()
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.capacity.map(NonZeroUsize::get)
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn ensure_open(&self) -> StoreResult<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Closed)
        }
    }

    /// Enforces capacity for a write that would leave `projected` entries.
    ///
    /// Must be called with the write lock held, before mutating.
    fn admit(&self, projected: usize) -> StoreResult<()> {
        match self.capacity {
            Some(capacity) if self.eviction == Eviction::Reject && projected > capacity.get() => {
                Err(StoreError::CapacityExceeded {
                    capacity: capacity.get(),
                })
            }
            _ => Ok(()),
        }
    }

    fn evict(&self, inner: &mut Inner) {
        if let Some(capacity) = self.capacity {
            let evicted = inner.evict_to(capacity.get());
            if evicted > 0 {
                debug!(evicted, capacity = capacity.get(), "memory store evicted entries");
            }
        }
    }
}

impl KeyValueStore for MemoryStore {
    fn open(&self) -> StoreResult<()> {
        if !self.open.swap(true, Ordering::AcqRel) {
            debug!(capacity = ?self.capacity(), "memory store opened");
        }
        Ok(())
    }

    fn close(&self) -> StoreResult<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!("memory store closed");
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        self.ensure_open()?;
        Ok(self.inner.read().entries.get(key).map(|slot| slot.value.clone()))
    }

    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        let projected = inner.entries.len() + usize::from(!inner.entries.contains_key(key));
        self.admit(projected)?;
        inner.insert(key.to_vec(), value.to_vec());
        self.evict(&mut inner);
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> StoreResult<()> {
        self.ensure_open()?;
        self.inner.write().remove(key);
        Ok(())
    }

    fn write_batch(&self, batch: WriteBatch) -> StoreResult<()> {
        self.ensure_open()?;
        let mut inner = self.inner.write();
        self.admit(inner.projected_len(batch.ops()))?;

        let count = batch.len();
        for op in batch {
            match op {
                BatchOp::Put { key, value } => inner.insert(key, value),
                BatchOp::Delete { key } => {
                    inner.remove(&key);
                }
            }
        }
        self.evict(&mut inner);
        trace!(ops = count, "memory store applied batch");
        Ok(())
    }

    fn scan_page(
        &self,
        prefix: &[u8],
        after: Option<&[u8]>,
        limit: usize,
    ) -> StoreResult<Vec<Entry>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let lower = match after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Included(prefix),
        };

        Ok(inner
            .entries
            .range::<[u8], _>((lower, Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .take(limit)
            .map(|(key, slot)| (key.clone(), slot.value.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ScanExt;

    fn open_store() -> MemoryStore {
        let store = MemoryStore::new();
        store.open().unwrap();
        store
    }

    fn bounded(capacity: usize, eviction: Eviction) -> MemoryStore {
        let store = MemoryStore::bounded(NonZeroUsize::new(capacity).unwrap(), eviction);
        store.open().unwrap();
        store
    }

    #[test]
    fn put_get_delete() {
        let store = open_store();
        store.put(b"k", b"v1").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v1".to_vec()));

        store.put(b"k", b"v2").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));

        store.delete(b"k").unwrap();
        assert_eq!(store.get(b"k").unwrap(), None);
        store.delete(b"k").unwrap();
    }

    #[test]
    fn closed_store_rejects_operations() {
        let store = MemoryStore::new();
        assert!(!store.is_open());
        assert!(matches!(store.get(b"k"), Err(StoreError::Closed)));
        assert!(matches!(store.put(b"k", b"v"), Err(StoreError::Closed)));

        store.open().unwrap();
        store.open().unwrap();
        assert!(store.is_open());

        store.close().unwrap();
        assert!(matches!(store.delete(b"k"), Err(StoreError::Closed)));
    }

    #[test]
    fn batch_applies_in_order() {
        let store = open_store();
        store.put(b"live", b"x").unwrap();

        let mut batch = WriteBatch::new();
        batch
            .delete(b"live".to_vec())
            .put(b"done".to_vec(), b"x".to_vec())
            .put(b"done".to_vec(), b"y".to_vec());
        store.write_batch(batch).unwrap();

        assert_eq!(store.get(b"live").unwrap(), None);
        assert_eq!(store.get(b"done").unwrap(), Some(b"y".to_vec()));
    }

    #[test]
    fn reject_policy_fails_whole_batch() {
        let store = bounded(2, Eviction::Reject);
        store.put(b"a", b"1").unwrap();

        let mut batch = WriteBatch::new();
        batch.put(b"b".to_vec(), b"2".to_vec()).put(b"c".to_vec(), b"3".to_vec());
        let err = store.write_batch(batch).unwrap_err();

        assert!(matches!(err, StoreError::CapacityExceeded { capacity: 2 }));
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn reject_policy_allows_overwrite_and_swap() {
        let store = bounded(1, Eviction::Reject);
        store.put(b"a", b"1").unwrap();
        store.put(b"a", b"2").unwrap();
        assert!(store.put(b"b", b"1").is_err());

        // delete + put in one batch keeps the size constant
        let mut batch = WriteBatch::new();
        batch.delete(b"a".to_vec()).put(b"b".to_vec(), b"1".to_vec());
        store.write_batch(batch).unwrap();
        assert_eq!(store.get(b"b").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn eviction_drops_least_recently_written() {
        let store = bounded(2, Eviction::LeastRecentlyWritten);
        store.put(b"a", b"1").unwrap();
        store.put(b"b", b"2").unwrap();
        store.put(b"a", b"3").unwrap();
        store.put(b"c", b"4").unwrap();

        assert_eq!(store.len(), 2);
        assert_eq!(store.get(b"b").unwrap(), None);
        assert_eq!(store.get(b"a").unwrap(), Some(b"3".to_vec()));
        assert_eq!(store.get(b"c").unwrap(), Some(b"4".to_vec()));
    }

    #[test]
    fn scan_returns_ascending_keys() {
        let store = open_store();
        for key in ["r\0c", "r\0a", "r\0b", "s\0a"] {
            store.put(key.as_bytes(), b"v").unwrap();
        }

        let keys: Vec<Vec<u8>> = store
            .scan_prefix(b"r\0")
            .map(|entry| entry.unwrap().0)
            .collect();
        assert_eq!(keys, vec![b"r\0a".to_vec(), b"r\0b".to_vec(), b"r\0c".to_vec()]);
    }

    #[test]
    fn concurrent_writers_on_distinct_keys() {
        use std::sync::Arc;
        use std::thread;

        let store = Arc::new(open_store());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for i in 0..50 {
                        let key = format!("t{}\0{}", t, i);
                        store.put(key.as_bytes(), b"v").unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.len(), 400);
    }
}
