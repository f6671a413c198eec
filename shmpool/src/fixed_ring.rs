//! Fixed-record ring buffer over a raw region.
//!
//! Region layout: `RingHeader | T[capacity]`. Indices advance modulo the
//! capacity (no power-of-two requirement); `used` disambiguates full from
//! empty.

use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::fixed_pool::Backing;
use crate::region::SharedMemory;
use crate::serial::Serial;

const RING_MAGIC: u64 = 0x7269_6E67_6669_7831;
const RING_VERSION: u64 = 1;

#[repr(C)]
struct RingHeader {
    magic: u64,
    version: u64,
    elem_size: u64,
    capacity: u64,
    start: u64,
    end: u64,
    used: u64,
}

fn align_up(n: usize, a: usize) -> usize {
    (n + a - 1) & !(a - 1)
}

/// Fixed-record ring buffer with optional overwrite-on-full.
pub struct FixedRing<T: Serial> {
    base: NonNull<u8>,
    #[allow(dead_code)]
    backing: Backing,
    _marker: PhantomData<T>,
}

impl<T: Serial> FixedRing<T> {
    fn stride() -> usize {
        align_up(std::mem::size_of::<T>().max(1), 8)
    }

    /// Bytes a region must provide for `capacity` records.
    pub fn bytes_needed(capacity: usize) -> usize {
        std::mem::size_of::<RingHeader>() + capacity * Self::stride()
    }

    /// Creates a ring over a freshly allocated heap region.
    pub fn with_capacity(capacity: usize) -> Result<Self> {
        let bytes = Self::bytes_needed(capacity);
        let words = vec![0u64; bytes.div_ceil(8)].into_boxed_slice();
        let ptr = words.as_ptr() as *mut u8;
        let mut ring = unsafe { Self::build(ptr, bytes, capacity, true)? };
        ring.backing = Backing::Owned(words);
        Ok(ring)
    }

    /// Initializes a fresh ring over a caller-provided region.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must be valid for reads and writes for the ring's
    /// lifetime and not aliased by another live container.
    pub unsafe fn init_region(ptr: *mut u8, len: usize, capacity: usize) -> Result<Self> {
        Self::build(ptr, len, capacity, true)
    }

    /// Attaches to a previously initialized region, validating the header.
    ///
    /// # Safety
    ///
    /// Same aliasing requirements as [`FixedRing::init_region`].
    pub unsafe fn attach_region(ptr: *mut u8, len: usize, capacity: usize) -> Result<Self> {
        Self::build(ptr, len, capacity, false)
    }

    /// Initializes a fresh ring over a shared-memory segment.
    ///
    /// # Safety
    ///
    /// No other process may concurrently mutate the segment.
    pub unsafe fn init_shared(shm: SharedMemory, capacity: usize) -> Result<Self> {
        let mut ring = Self::build(shm.as_ptr(), shm.len(), capacity, true)?;
        ring.backing = Backing::Shared(shm);
        Ok(ring)
    }

    unsafe fn build(ptr: *mut u8, len: usize, capacity: usize, fresh: bool) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        if std::mem::align_of::<T>() > 8 {
            return Err(Error::UnsupportedAlignment);
        }
        if ptr.is_null() || (ptr as usize) % 8 != 0 {
            return Err(Error::Misaligned);
        }
        let need = Self::bytes_needed(capacity);
        if need > len {
            return Err(Error::RegionTooSmall { need, got: len });
        }

        let header = ptr.cast::<RingHeader>();
        if fresh {
            (*header).magic = RING_MAGIC;
            (*header).version = RING_VERSION;
            (*header).elem_size = Self::stride() as u64;
            (*header).capacity = capacity as u64;
            (*header).start = 0;
            (*header).end = 0;
            (*header).used = 0;
        } else {
            if (*header).magic != RING_MAGIC {
                return Err(Error::BadHeader { field: "magic" });
            }
            if (*header).version != RING_VERSION {
                return Err(Error::BadHeader { field: "version" });
            }
            if (*header).elem_size != Self::stride() as u64 {
                return Err(Error::BadHeader { field: "elem_size" });
            }
            if (*header).capacity != capacity as u64 {
                return Err(Error::BadHeader { field: "capacity" });
            }
            if (*header).used > capacity as u64
                || (*header).start >= capacity as u64
                || (*header).end >= capacity as u64
            {
                return Err(Error::BadHeader { field: "indices" });
            }
        }

        Ok(Self {
            base: NonNull::new_unchecked(ptr),
            backing: Backing::Borrowed,
            _marker: PhantomData,
        })
    }

    fn header(&self) -> &RingHeader {
        unsafe { &*self.base.as_ptr().cast::<RingHeader>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut RingHeader {
        unsafe { &mut *self.base.as_ptr().cast::<RingHeader>() }
    }

    fn slot_ptr(&self, idx: u64) -> *mut T {
        debug_assert!(idx < self.header().capacity);
        unsafe {
            self.base
                .as_ptr()
                .add(std::mem::size_of::<RingHeader>() + idx as usize * Self::stride())
                .cast()
        }
    }

    /// Appends a record. When full: overwrites the oldest if `overwrite`,
    /// otherwise fails.
    pub fn push(&mut self, value: T, overwrite: bool) -> bool {
        if self.is_full() {
            if !overwrite {
                return false;
            }
            self.pop();
        }
        let end = self.header().end;
        unsafe { *self.slot_ptr(end) = value };
        let cap = self.header().capacity;
        let h = self.header_mut();
        h.end = (end + 1) % cap;
        h.used += 1;
        true
    }

    /// Removes and returns the oldest record.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let start = self.header().start;
        let v = unsafe { *self.slot_ptr(start) };
        let cap = self.header().capacity;
        let h = self.header_mut();
        h.start = (start + 1) % cap;
        h.used -= 1;
        Some(v)
    }

    /// The `index`-th oldest record without removing it.
    pub fn front(&self, index: usize) -> Option<&T> {
        let h = self.header();
        if index as u64 >= h.used {
            return None;
        }
        let idx = (h.start + index as u64) % h.capacity;
        Some(unsafe { &*self.slot_ptr(idx) })
    }

    /// The `index`-th newest record without removing it.
    pub fn back(&self, index: usize) -> Option<&T> {
        let h = self.header();
        if index as u64 >= h.used {
            return None;
        }
        let idx = (h.end + h.capacity - 1 - index as u64) % h.capacity;
        Some(unsafe { &*self.slot_ptr(idx) })
    }

    pub fn len(&self) -> usize {
        self.header().used as usize
    }

    pub fn is_empty(&self) -> bool {
        self.header().used == 0
    }

    pub fn is_full(&self) -> bool {
        let h = self.header();
        h.used >= h.capacity
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn clear(&mut self) {
        let h = self.header_mut();
        h.start = 0;
        h.end = 0;
        h.used = 0;
    }
}
