//! Hash-indexed pool: a [`FixedPool`] of entries plus a bucket array.
//!
//! Region layout: `HashHeader | bucket[bucket_count] | pool region`.
//!
//! Each bucket heads a singly linked chain threaded through the entries'
//! `next` field. Keys are restricted to [`Serial`] types so the whole
//! structure can live in an attachable region; hashing uses fixed seeds so
//! bucket placement survives re-attach from another process.

use std::hash::Hash;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::fixed_pool::{Backing, FixedPool};
use crate::region::SharedMemory;
use crate::serial::Serial;
use crate::NULL_HANDLE;

const HASH_MAGIC: u64 = 0x6861_7368_706F_6F6C;
const HASH_VERSION: u64 = 1;

// Fixed seeds: bucket placement must be identical across processes that
// attach the same region.
const HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243F_6A88_85A3_08D3,
    0x1319_8A2E_0370_7344,
    0xA409_3822_299F_31D0,
    0x082E_FA98_EC4E_6C89,
);

#[repr(C)]
struct HashHeader {
    magic: u64,
    version: u64,
    capacity: u64,
    bucket_count: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct HashEntry<K: Copy, V: Copy> {
    pub key: K,
    pub value: V,
    pub next: u64,
}

unsafe impl<K: Serial, V: Serial> Serial for HashEntry<K, V> {}

fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

/// Keyed fixed-capacity storage over a raw region.
pub struct HashPool<K: Serial + Eq + Hash, V: Serial> {
    base: NonNull<u8>,
    pool: FixedPool<HashEntry<K, V>>,
    hasher: ahash::RandomState,
    _marker: PhantomData<(K, V)>,
}

impl<K: Serial + Eq + Hash, V: Serial> HashPool<K, V> {
    fn bucket_offset() -> usize {
        std::mem::size_of::<HashHeader>()
    }

    fn pool_offset(bucket_count: usize) -> usize {
        align_up(Self::bucket_offset() + bucket_count * 8, 8)
    }

    /// Bytes a region must provide for `capacity` entries over
    /// `bucket_count` buckets.
    pub fn bytes_needed(capacity: usize, bucket_count: usize) -> usize {
        Self::pool_offset(bucket_count) + FixedPool::<HashEntry<K, V>>::bytes_needed(capacity)
    }

    /// Creates a pool over a freshly allocated heap region. The bucket count
    /// defaults to the capacity.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        Self::with_capacity_and_buckets(capacity, capacity)
    }

    /// Creates a pool over a freshly allocated heap region with an explicit
    /// bucket count.
    pub fn with_capacity_and_buckets(capacity: usize, bucket_count: usize) -> Result<Self> {
        let bytes = Self::bytes_needed(capacity, bucket_count);
        let words = vec![0u64; bytes.div_ceil(8)].into_boxed_slice();
        let ptr = words.as_ptr() as *mut u8;
        let mut this = unsafe { Self::build(ptr, bytes, capacity, bucket_count, true)? };
        this.pool.set_backing(Backing::Owned(words));
        Ok(this)
    }

    /// Initializes a fresh pool over a caller-provided region.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must be valid for reads and writes for the pool's
    /// lifetime and not aliased by another live container.
    pub unsafe fn init_region(
        ptr: *mut u8,
        len: usize,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Self::build(ptr, len, capacity, bucket_count, true)
    }

    /// Attaches to a previously initialized region, validating the header.
    ///
    /// # Safety
    ///
    /// Same aliasing requirements as [`HashPool::init_region`].
    pub unsafe fn attach_region(
        ptr: *mut u8,
        len: usize,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        Self::build(ptr, len, capacity, bucket_count, false)
    }

    /// Initializes a fresh pool over a shared-memory segment, taking
    /// ownership of the mapping.
    ///
    /// # Safety
    ///
    /// No other process may concurrently mutate the segment.
    pub unsafe fn init_shared(
        shm: SharedMemory,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        let mut this = Self::build(shm.as_ptr(), shm.len(), capacity, bucket_count, true)?;
        this.pool.set_backing(Backing::Shared(shm));
        Ok(this)
    }

    /// Attaches to an already initialized shared-memory segment.
    ///
    /// # Safety
    ///
    /// No other process may concurrently mutate the segment.
    pub unsafe fn attach_shared(
        shm: SharedMemory,
        capacity: usize,
        bucket_count: usize,
    ) -> Result<Self> {
        let mut this = Self::build(shm.as_ptr(), shm.len(), capacity, bucket_count, false)?;
        this.pool.set_backing(Backing::Shared(shm));
        Ok(this)
    }

    unsafe fn build(
        ptr: *mut u8,
        len: usize,
        capacity: usize,
        bucket_count: usize,
        fresh: bool,
    ) -> Result<Self> {
        if bucket_count == 0 {
            return Err(Error::InvalidCapacity);
        }
        if ptr.is_null() || (ptr as usize) % 8 != 0 {
            return Err(Error::Misaligned);
        }
        let need = Self::bytes_needed(capacity, bucket_count);
        if need > len {
            return Err(Error::RegionTooSmall { need, got: len });
        }

        let header = ptr.cast::<HashHeader>();
        if fresh {
            (*header).magic = HASH_MAGIC;
            (*header).version = HASH_VERSION;
            (*header).capacity = capacity as u64;
            (*header).bucket_count = bucket_count as u64;
            std::ptr::write_bytes(ptr.add(Self::bucket_offset()), 0, bucket_count * 8);
        } else {
            if (*header).magic != HASH_MAGIC {
                return Err(Error::BadHeader { field: "magic" });
            }
            if (*header).version != HASH_VERSION {
                return Err(Error::BadHeader { field: "version" });
            }
            if (*header).capacity != capacity as u64 {
                return Err(Error::BadHeader { field: "capacity" });
            }
            if (*header).bucket_count != bucket_count as u64 {
                return Err(Error::BadHeader { field: "bucket_count" });
            }
        }

        let pool_ptr = ptr.add(Self::pool_offset(bucket_count));
        let pool_len = len - Self::pool_offset(bucket_count);
        let pool = if fresh {
            FixedPool::init_region(pool_ptr, pool_len, capacity)?
        } else {
            FixedPool::attach_region(pool_ptr, pool_len, capacity)?
        };

        let (k0, k1, k2, k3) = HASH_SEEDS;
        Ok(Self {
            base: NonNull::new_unchecked(ptr),
            pool,
            hasher: ahash::RandomState::with_seeds(k0, k1, k2, k3),
            _marker: PhantomData,
        })
    }

    fn bucket_count(&self) -> usize {
        unsafe { (*self.base.as_ptr().cast::<HashHeader>()).bucket_count as usize }
    }

    fn bucket_ptr(&self, idx: usize) -> *mut u64 {
        debug_assert!(idx < self.bucket_count());
        unsafe { self.base.as_ptr().add(Self::bucket_offset()).cast::<u64>().add(idx) }
    }

    fn bucket(&self, idx: usize) -> u64 {
        unsafe { *self.bucket_ptr(idx) }
    }

    fn set_bucket(&mut self, idx: usize, v: u64) {
        unsafe { *self.bucket_ptr(idx) = v }
    }

    fn bucket_index(&self, key: &K) -> usize {
        (self.hasher.hash_one(key) % self.bucket_count() as u64) as usize
    }

    /// Handle of the entry holding `key`, or the null handle.
    pub fn find_handle(&self, key: &K) -> u32 {
        let mut cur = self.bucket(self.bucket_index(key));
        while cur != 0 {
            let Some(entry) = self.pool.get(cur as u32) else {
                // Broken chain in an attached region; treat as absent.
                return NULL_HANDLE;
            };
            if entry.key == *key {
                return cur as u32;
            }
            cur = entry.next;
        }
        NULL_HANDLE
    }

    /// True when `key` is present.
    pub fn contains(&self, key: &K) -> bool {
        self.find_handle(key) != NULL_HANDLE
    }

    /// Inserts a new entry. Idempotent in the key: returns `false` when the
    /// key is already present (the stored value is left untouched) or the
    /// pool is full.
    pub fn insert(&mut self, key: K, value: V) -> bool {
        if self.contains(&key) || self.pool.is_full() {
            return false;
        }
        let bucket = self.bucket_index(&key);
        let head = self.bucket(bucket);
        let h = self.pool.alloc(false).expect("not full");
        *self.pool.get_mut(h).expect("just allocated") = HashEntry { key, value, next: head };
        self.set_bucket(bucket, h as u64);
        true
    }

    /// Shared access to the value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        let h = self.find_handle(key);
        if h == NULL_HANDLE {
            return None;
        }
        Some(&self.pool.get(h).expect("live").value)
    }

    /// Exclusive access to the value for `key`.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let h = self.find_handle(key);
        if h == NULL_HANDLE {
            return None;
        }
        Some(&mut self.pool.get_mut(h).expect("live").value)
    }

    /// Removes `key`. Returns `false` when absent.
    pub fn erase(&mut self, key: &K) -> bool {
        let bucket = self.bucket_index(key);
        let mut prev = NULL_HANDLE;
        let mut cur = self.bucket(bucket) as u32;
        while cur != NULL_HANDLE {
            let Some(&entry) = self.pool.get(cur) else {
                return false;
            };
            if entry.key == *key {
                if prev == NULL_HANDLE {
                    self.set_bucket(bucket, entry.next);
                } else {
                    self.pool.get_mut(prev).expect("live").next = entry.next;
                }
                self.pool.free(cur);
                return true;
            }
            prev = cur;
            cur = entry.next as u32;
        }
        false
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.pool.len()
    }

    /// True when no entry is live.
    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }

    /// True when every slot is live.
    pub fn is_full(&self) -> bool {
        self.pool.is_full()
    }

    /// Entry capacity.
    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        let buckets = self.bucket_count();
        for i in 0..buckets {
            self.set_bucket(i, 0);
        }
        self.pool.clear();
    }

    /// Iterates entries in pool-list order (insertion order unless the
    /// recency helpers reordered them).
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.pool.iter().map(|(_, e)| (&e.key, &e.value))
    }

    // Handle-level access for the recency layer.

    /// Key stored at a live handle.
    pub(crate) fn key_at(&self, handle: u32) -> Option<K> {
        self.pool.get(handle).map(|e| e.key)
    }

    /// Value stored at a live handle.
    pub(crate) fn value_at(&self, handle: u32) -> Option<&V> {
        self.pool.get(handle).map(|e| &e.value)
    }

    /// Front of the pool list (the oldest or least-recent entry).
    pub(crate) fn front_handle(&self) -> u32 {
        self.pool.first()
    }

    /// Moves a live handle to the back of the pool list.
    pub(crate) fn touch(&mut self, handle: u32) -> bool {
        self.pool.move_to_back(handle)
    }
}
