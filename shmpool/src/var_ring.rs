//! Variable-record ring buffer over a raw region.
//!
//! Region layout: `VarHeader | data[capacity]`. Each record is framed with a
//! 5-byte header: a flag byte (0 = data, 1 = padding) and a u32 length.
//! Records never wrap: when a record would cross the buffer end, a padding
//! record fills the remainder (or, when fewer than 5 bytes remain, the tail
//! is skipped implicitly and accounted in `used`). Readers skip padding
//! silently, so `front` can always hand out one contiguous slice.

use std::ptr::NonNull;

use crate::error::{Error, Result};
use crate::fixed_pool::Backing;
use crate::region::SharedMemory;

const VAR_MAGIC: u64 = 0x7661_7272_696E_6731;
const VAR_VERSION: u64 = 1;

/// Bytes of the per-record frame header.
const REC_HDR: usize = 5;

const FLAG_DATA: u8 = 0;
const FLAG_PADDING: u8 = 1;

#[repr(C)]
struct VarHeader {
    magic: u64,
    version: u64,
    capacity: u64,
    start: u64,
    end: u64,
    used: u64,
    items: u64,
}

/// Variable-record ring buffer with optional overwrite-on-full.
pub struct VarRing {
    base: NonNull<u8>,
    #[allow(dead_code)]
    backing: Backing,
}

impl VarRing {
    /// Bytes a region must provide for `capacity` data bytes.
    pub fn bytes_needed(capacity: usize) -> usize {
        std::mem::size_of::<VarHeader>() + capacity
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
    /// Same aliasing requirements as [`VarRing::init_region`].
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
        if capacity <= REC_HDR {
            return Err(Error::InvalidCapacity);
        }
        if ptr.is_null() || (ptr as usize) % 8 != 0 {
            return Err(Error::Misaligned);
        }
        let need = Self::bytes_needed(capacity);
        if need > len {
            return Err(Error::RegionTooSmall { need, got: len });
        }

        let header = ptr.cast::<VarHeader>();
        if fresh {
            (*header).magic = VAR_MAGIC;
            (*header).version = VAR_VERSION;
            (*header).capacity = capacity as u64;
            (*header).start = 0;
            (*header).end = 0;
            (*header).used = 0;
            (*header).items = 0;
        } else {
            if (*header).magic != VAR_MAGIC {
                return Err(Error::BadHeader { field: "magic" });
            }
            if (*header).version != VAR_VERSION {
                return Err(Error::BadHeader { field: "version" });
            }
            if (*header).capacity != capacity as u64 {
                return Err(Error::BadHeader { field: "capacity" });
            }
            if (*header).used > capacity as u64
                || (*header).start >= capacity as u64
                || (*header).end > capacity as u64
            {
                return Err(Error::BadHeader { field: "indices" });
            }
        }

        Ok(Self { base: NonNull::new_unchecked(ptr), backing: Backing::Borrowed })
    }

    fn header(&self) -> &VarHeader {
        unsafe { &*self.base.as_ptr().cast::<VarHeader>() }
    }

    #[allow(clippy::mut_from_ref)]
    fn header_mut(&self) -> &mut VarHeader {
        unsafe { &mut *self.base.as_ptr().cast::<VarHeader>() }
    }

    // `pos == capacity` is allowed for zero-length access at the buffer end.
    fn data_ptr(&self, pos: u64) -> *mut u8 {
        debug_assert!(pos <= self.header().capacity);
        unsafe { self.base.as_ptr().add(std::mem::size_of::<VarHeader>() + pos as usize) }
    }

    fn read_rec(&self, pos: u64) -> (u8, u32) {
        debug_assert!(pos + REC_HDR as u64 <= self.header().capacity);
        unsafe {
            let p = self.data_ptr(pos);
            let flag = *p;
            let mut len_bytes = [0u8; 4];
            std::ptr::copy_nonoverlapping(p.add(1), len_bytes.as_mut_ptr(), 4);
            (flag, u32::from_le_bytes(len_bytes))
        }
    }

    fn write_rec(&mut self, pos: u64, flag: u8, len: u32) {
        debug_assert!(pos + REC_HDR as u64 <= self.header().capacity);
        unsafe {
            let p = self.data_ptr(pos);
            *p = flag;
            std::ptr::copy_nonoverlapping(len.to_le_bytes().as_ptr(), p.add(1), 4);
        }
    }

    /// Appends a record. With `overwrite`, the oldest records are popped
    /// until enough contiguous space exists; without it, the push fails when
    /// space is lacking. Records longer than `capacity - 5` always fail.
    pub fn push(&mut self, data: &[u8], overwrite: bool) -> bool {
        let cap = self.header().capacity;
        let need = (REC_HDR + data.len()) as u64;
        if need > cap {
            return false;
        }

        loop {
            if self.header().used >= cap {
                if !overwrite {
                    return false;
                }
                self.drop_front();
                continue;
            }

            let (start, end) = {
                let h = self.header();
                (h.start, h.end)
            };

            if end >= start {
                // Not wrapped: free space is [end, cap) then [0, start).
                if end + need <= cap {
                    self.write_data(end, data, true);
                    return true;
                }
                if !overwrite && start < need {
                    return false;
                }
                self.push_padding();
                if overwrite {
                    while !self.is_empty() && self.header().start < need {
                        self.drop_front();
                    }
                }
            } else {
                // Wrapped: free space is [end, start).
                if end + need <= start {
                    self.write_data(end, data, false);
                    return true;
                }
                if !overwrite {
                    return false;
                }
                if end + need <= cap {
                    while self.wrapped() && self.header().end + need > self.header().start {
                        self.drop_front();
                    }
                } else {
                    while self.wrapped() {
                        self.drop_front();
                    }
                }
            }
        }
    }

    fn wrapped(&self) -> bool {
        let h = self.header();
        h.end < h.start
    }

    fn write_data(&mut self, pos: u64, data: &[u8], apply_tail_skip: bool) {
        let cap = self.header().capacity;
        let need = (REC_HDR + data.len()) as u64;
        self.write_rec(pos, FLAG_DATA, data.len() as u32);
        if !data.is_empty() {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    data.as_ptr(),
                    self.data_ptr(pos + REC_HDR as u64),
                    data.len(),
                );
            }
        }
        let mut end = (pos + need) % cap;
        let mut used = self.header().used + need;
        if apply_tail_skip && end != 0 && cap - end < REC_HDR as u64 {
            // Too little tail room for another header: account it as consumed.
            used += cap - end;
            end = 0;
        }
        let h = self.header_mut();
        h.end = end;
        h.used = used;
        h.items += 1;
    }

    fn push_padding(&mut self) {
        let (end, cap) = {
            let h = self.header();
            (h.end, h.capacity)
        };
        let remaining = cap - end;
        debug_assert!(remaining >= REC_HDR as u64);
        self.write_rec(end, FLAG_PADDING, (remaining - REC_HDR as u64) as u32);
        let h = self.header_mut();
        h.used += remaining;
        h.end = 0;
    }

    /// Removes the oldest record without returning it.
    fn drop_front(&mut self) {
        if self.is_empty() {
            return;
        }
        let start = self.header().start;
        let (flag, len) = self.read_rec(start);
        debug_assert_eq!(flag, FLAG_DATA);
        self.advance_front(REC_HDR as u64 + len as u64);
    }

    fn advance_front(&mut self, rec_bytes: u64) {
        let cap = self.header().capacity;
        {
            let h = self.header_mut();
            h.start = (h.start + rec_bytes) % cap;
            h.used -= rec_bytes;
            h.items -= 1;
        }

        if self.header().used > 0 {
            let start = self.header().start;
            if cap - start < REC_HDR as u64 {
                // Implicit tail skip left by the writer.
                let h = self.header_mut();
                h.used -= cap - start;
                h.start = 0;
            } else {
                let (flag, len) = self.read_rec(start);
                if flag == FLAG_PADDING {
                    let h = self.header_mut();
                    h.used -= REC_HDR as u64 + len as u64;
                    h.start = (start + REC_HDR as u64 + len as u64) % cap;
                }
            }
        }

        if self.header().used == 0 {
            let h = self.header_mut();
            h.start = 0;
            h.end = 0;
            h.items = 0;
        }
    }

    /// Removes and returns the oldest record.
    pub fn pop(&mut self) -> Option<Vec<u8>> {
        let out = self.front()?.to_vec();
        let start = self.header().start;
        let (_, len) = self.read_rec(start);
        self.advance_front(REC_HDR as u64 + len as u64);
        Some(out)
    }

    /// The oldest record as one contiguous slice, without removing it.
    pub fn front(&self) -> Option<&[u8]> {
        if self.is_empty() {
            return None;
        }
        let start = self.header().start;
        let (flag, len) = self.read_rec(start);
        debug_assert_eq!(flag, FLAG_DATA);
        Some(unsafe {
            std::slice::from_raw_parts(self.data_ptr(start + REC_HDR as u64), len as usize)
        })
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.header().items as usize
    }

    /// True when no record is stored.
    pub fn is_empty(&self) -> bool {
        self.header().used == 0
    }

    /// Occupied bytes, including record headers and padding.
    pub fn bytes_used(&self) -> usize {
        self.header().used as usize
    }

    /// Data-area capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.header().capacity as usize
    }

    pub fn clear(&mut self) {
        let h = self.header_mut();
        h.start = 0;
        h.end = 0;
        h.used = 0;
        h.items = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[test]
    fn fifo_bytes_across_wrap() {
        let mut ring = VarRing::with_capacity(64).unwrap();
        let mut model: VecDeque<Vec<u8>> = VecDeque::new();

        // Deterministic pseudo-random record sizes.
        let mut seed = 0x2545_F491_4F6C_DD1Du64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };

        for round in 0..500u64 {
            let len = (next() % 20) as usize;
            let payload: Vec<u8> = (0..len).map(|i| (round as u8).wrapping_add(i as u8)).collect();
            if ring.push(&payload, false) {
                model.push_back(payload);
            } else {
                // Drain a few and retry; popped bytes must match the model.
                for _ in 0..3 {
                    match (ring.pop(), model.pop_front()) {
                        (Some(a), Some(b)) => assert_eq!(a, b),
                        (None, None) => break,
                        _ => panic!("ring and model disagree"),
                    }
                }
            }
        }
        while let Some(got) = ring.pop() {
            assert_eq!(got, model.pop_front().unwrap());
        }
        assert!(model.is_empty());
        assert!(ring.is_empty());
    }

    #[test]
    fn overwrite_pops_oldest_until_room() {
        let mut ring = VarRing::with_capacity(32).unwrap();
        assert!(ring.push(&[1u8; 10], false));
        assert!(ring.push(&[2u8; 10], false));
        // 30 of 32 bytes used; a 10-byte record needs evictions.
        assert!(ring.push(&[3u8; 10], true));
        let front = ring.pop().unwrap();
        assert!(front == vec![2u8; 10] || front == vec![3u8; 10]);
    }

    #[test]
    fn record_larger_than_capacity_fails() {
        let mut ring = VarRing::with_capacity(16).unwrap();
        assert!(!ring.push(&[0u8; 16], true));
    }

    #[test]
    fn front_matches_pop() {
        let mut ring = VarRing::with_capacity(64).unwrap();
        assert!(ring.push(b"hello", false));
        assert!(ring.push(b"world!", false));
        assert_eq!(ring.front(), Some(&b"hello"[..]));
        assert_eq!(ring.pop().unwrap(), b"hello");
        assert_eq!(ring.front(), Some(&b"world!"[..]));
    }

    #[test]
    fn empty_record_roundtrip() {
        let mut ring = VarRing::with_capacity(16).unwrap();
        assert!(ring.push(&[], false));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop().unwrap(), Vec::<u8>::new());
        assert!(ring.is_empty());
    }
}
