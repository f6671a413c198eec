//! Set and map facades over [`HashPool`].

use std::hash::Hash;

use crate::error::Result;
use crate::hash_pool::HashPool;
use crate::region::SharedMemory;
use crate::serial::Serial;

/// Fixed-capacity keyed map over a raw region.
pub struct MemMap<K: Serial + Eq + Hash, V: Serial> {
    inner: HashPool<K, V>,
}

impl<K: Serial + Eq + Hash, V: Serial> MemMap<K, V> {
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

    /// Attaches to an already initialized shared-memory segment.
    ///
    /// # Safety
    ///
    /// See [`HashPool::attach_shared`].
    pub unsafe fn attach_shared(
        shm: SharedMemory,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Ok(Self { inner: HashPool::attach_shared(shm, capacity, bucket_count)? })
    }

    /// Inserts; `false` when the key exists or the map is full.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        self.inner.insert(key, value)
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

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }
}

/// Fixed-capacity key set over a raw region.
pub struct MemSet<K: Serial + Eq + Hash> {
    inner: HashPool<K, ()>,
}

impl<K: Serial + Eq + Hash> MemSet<K> {
    /// Bytes a region must provide for `capacity` keys.
    pub fn bytes_needed(capacity: usize, bucket_count: usize) -> usize {
        HashPool::<K, ()>::bytes_needed(capacity, bucket_count)
    }

    /// Creates a set over a freshly allocated heap region.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Ok(Self { inner: HashPool::with_capacity(capacity)? })
    }

    /// Initializes a fresh set over a caller-provided region.
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

    /// Inserts; `false` when the key exists or the set is full.
    pub fn insert(&mut self, key: K) -> bool {
        self.inner.insert(key, ())
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

    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.inner.iter().map(|(k, _)| k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_semantics() {
        let mut set = MemSet::<u32>::with_capacity(4).unwrap();
        assert!(set.insert(1));
        assert!(!set.insert(1));
        assert!(set.contains(&1));
        assert!(set.erase(&1));
        assert!(!set.contains(&1));
    }

    #[test]
    fn map_updates_through_get_mut() {
        let mut map = MemMap::<u32, u64>::with_capacity(4).unwrap();
        assert!(map.insert(5, 50));
        *map.get_mut(&5).unwrap() = 55;
        assert_eq!(map.get(&5), Some(&55));
    }
}
