//! Keyed storage with a least-recently-used recency chain.
//!
//! Reuses the [`HashPool`] slot list as the recency chain: the front of the
//! list is the least-recent entry, the back is the most-recent. `active`
//! relinks in O(1); `disuse` walks from the least-recent end and may be
//! halted by a predicate.

use std::hash::Hash;

use crate::error::Result;
use crate::hash_pool::HashPool;
use crate::region::SharedMemory;
use crate::serial::Serial;
use crate::NULL_HANDLE;

/// Predicate consulted before each eviction; returning `false` halts.
pub type DisusePred<'a, K, V> = &'a mut dyn FnMut(&K, &V) -> bool;

/// Fixed-capacity LRU map over a raw region.
pub struct MemLruMap<K: Serial + Eq + Hash, V: Serial> {
    inner: HashPool<K, V>,
}

impl<K: Serial + Eq + Hash, V: Serial> MemLruMap<K, V> {
    /// Bytes a region must provide for `capacity` entries.
    pub fn bytes_needed(capacity: usize, bucket_count: usize) -> usize {
        HashPool::<K, V>::bytes_needed(capacity, bucket_count)
    }

    /// Creates a map over a freshly allocated heap region.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self { inner: HashPool::with_capacity(capacity)? })
    }

    /// Initializes a fresh map over a caller-provided region.
    ///
    /// # Safety
    ///
    /// See [`HashPool::init_region`].
    pub unsafe fn init_region(
        ptr: *mut u8,
        len: usize,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Ok(Self { inner: HashPool::init_region(ptr, len, capacity, bucket_count)? })
    }

    /// Attaches to a previously initialized region.
    ///
    /// # Safety
    ///
    /// See [`HashPool::attach_region`].
    pub unsafe fn attach_region(
        ptr: *mut u8,
        len: usize,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Ok(Self { inner: HashPool::attach_region(ptr, len, capacity, bucket_count)? })
    }

    /// Initializes a fresh map over a shared-memory segment.
    ///
    /// # Safety
    ///
    /// See [`HashPool::init_shared`].
    pub unsafe fn init_shared(
        shm: SharedMemory,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Ok(Self { inner: HashPool::init_shared(shm, capacity, bucket_count)? })
    }

    /// Inserts as the most-recent entry.
    ///
    /// On a full map: an existing key fails (no update, no reorder); with
    /// `force` the least-recent entries satisfying `pred` are evicted until
    /// there is room, and the insert fails if eviction stalls.
    pub fn insert(
        &mut self,
        key: K,
        value: V,
        force: bool,
        mut pred: Option<DisusePred<'_, K, V>>,
    ) -> bool {
        if self.inner.is_full() {
            if self.inner.contains(&key) || !force {
                return false;
            }
            let evicted = match pred.as_mut() {
                Some(p) => self.disuse(1, Some(&mut **p)),
                None => self.disuse(1, None),
            };
            if evicted == 0 {
                return false;
            }
        }
        self.inner.insert(key, value)
    }

    /// Marks `key` most-recent. Returns `false` when absent.
    pub fn active(&mut self, key: &K) -> bool {
        let h = self.inner.find_handle(key);
        if h == NULL_HANDLE {
            return false;
        }
        self.inner.touch(h)
    }

    /// Evicts up to `num` entries, least-recent first. A predicate returning
    /// `false` halts eviction without touching further entries. Returns the
    /// number evicted.
    pub fn disuse(&mut self, num: usize, mut pred: Option<DisusePred<'_, K, V>>) -> usize {
        for i in 0..num {
            let h = self.inner.front_handle();
            if h == NULL_HANDLE {
                return i;
            }
            if let Some(p) = pred.as_mut() {
                let key = self.inner.key_at(h).expect("front handle is live");
                let value = self.inner.value_at(h).expect("front handle is live");
                if !p(&key, value) {
                    return i;
                }
            }
            let key = self.inner.key_at(h).expect("front handle is live");
            self.inner.erase(&key);
        }
        num
    }

    /// Key of the least-recent entry, if any.
    pub fn least_recent(&self) -> Option<K> {
        let h = self.inner.front_handle();
        if h == NULL_HANDLE {
            return None;
        }
        self.inner.key_at(h)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn erase(&mut self, key: &K) -> bool {
        self.inner.erase(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.inner.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }

    /// Iterates entries from least-recent to most-recent.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }
}

/// Fixed-capacity LRU set over a raw region.
pub struct MemLruSet<K: Serial + Eq + Hash> {
    inner: MemLruMap<K, ()>,
}

impl<K: Serial + Eq + Hash> MemLruSet<K> {
    /// Bytes a region must provide for `capacity` keys.
    pub fn bytes_needed(capacity: usize, bucket_count: usize) -> usize {
        MemLruMap::<K, ()>::bytes_needed(capacity, bucket_count)
    }

    /// Creates a set over a freshly allocated heap region.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self { inner: MemLruMap::with_capacity(capacity)? })
    }

    /// Inserts as the most-recent key; see [`MemLruMap::insert`].
    pub fn insert(&mut self, key: K, force: bool, pred: Option<&mut dyn FnMut(&K) -> bool>) -> bool {
        match pred {
            Some(p) => self.inner.insert(key, (), force, Some(&mut |k: &K, _: &()| p(k))),
            None => self.inner.insert(key, (), force, None),
        }
    }

    /// Marks `key` most-recent.
    pub fn active(&mut self, key: &K) -> bool {
        self.inner.active(key)
    }

    /// Evicts up to `num` keys, least-recent first.
    pub fn disuse(&mut self, num: usize, pred: Option<&mut dyn FnMut(&K) -> bool>) -> usize {
        match pred {
            Some(p) => self.inner.disuse(num, Some(&mut |k: &K, _: &()| p(k))),
            None => self.inner.disuse(num, None),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.contains(key)
    }

    pub fn erase(&mut self, key: &K) -> bool {
        self.inner.erase(key)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn clear(&mut self) {
        self.inner.clear()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_active_set_most_recent() {
        let mut lru = MemLruMap::<u32, u32>::with_capacity(3).unwrap();
        assert!(lru.insert(1, 10, false, None));
        assert!(lru.insert(2, 20, false, None));
        assert!(lru.insert(3, 30, false, None));
        assert_eq!(lru.least_recent(), Some(1));

        assert!(lru.active(&1));
        assert_eq!(lru.least_recent(), Some(2));
    }

    #[test]
    fn disuse_with_predicate_halts() {
        // 3-slot map holding 1, 2, 3 in insertion order.
        let mut lru = MemLruMap::<u32, u32>::with_capacity(3).unwrap();
        for k in 1..=3u32 {
            assert!(lru.insert(k, k, false, None));
        }

        let evicted = lru.disuse(5, Some(&mut |k: &u32, _| *k != 2));
        assert_eq!(evicted, 1, "predicate rejects key 2, halting after key 1");
        assert!(!lru.contains(&1));
        assert!(lru.contains(&2));
        assert!(lru.contains(&3));

        assert!(lru.active(&3));
        assert_eq!(lru.least_recent(), Some(2));
    }

    #[test]
    fn disuse_removes_min_of_n_and_size() {
        let mut lru = MemLruMap::<u32, u32>::with_capacity(4).unwrap();
        for k in 0..4u32 {
            assert!(lru.insert(k, k, false, None));
        }
        assert_eq!(lru.disuse(10, None), 4);
        assert!(lru.is_empty());
        assert_eq!(lru.disuse(1, None), 0);
    }

    #[test]
    fn forced_insert_evicts_least_recent() {
        let mut lru = MemLruMap::<u32, u32>::with_capacity(2).unwrap();
        assert!(lru.insert(1, 1, false, None));
        assert!(lru.insert(2, 2, false, None));
        assert!(!lru.insert(3, 3, false, None), "full without force");
        assert!(lru.insert(3, 3, true, None));
        assert!(!lru.contains(&1), "least-recent evicted");
        assert!(lru.contains(&2));
        assert!(lru.contains(&3));
    }

    #[test]
    fn forced_insert_respects_predicate() {
        let mut lru = MemLruMap::<u32, u32>::with_capacity(2).unwrap();
        assert!(lru.insert(1, 1, false, None));
        assert!(lru.insert(2, 2, false, None));
        let ok = lru.insert(3, 3, true, Some(&mut |_, _| false));
        assert!(!ok, "eviction stalled by predicate");
        assert_eq!(lru.len(), 2);
    }
}
