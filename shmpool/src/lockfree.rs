//! Bounded lock-free queue: many producers, one consumer.
//!
//! Producers claim a slot by CAS on the tail index (packed with a version
//! counter to close the ABA window), write the payload, then publish a
//! per-slot ready flag with release ordering. The single consumer reads the
//! head slot's ready flag (reporting `Again` while a claimed slot is still
//! being written), copies the payload out, clears the flag, and advances
//! head. CAS retries are bounded: after 100 failed attempts the push returns
//! `TryMax` instead of spinning forever.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::serial::Serial;

/// Bounded CAS attempts before a push gives up.
const MAX_TRY_TIMES: u32 = 100;

/// Error type for queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is full.
    Full,
    /// The head slot is claimed but its payload is not yet published.
    Again,
    /// Tail CAS failed `MAX_TRY_TIMES` times in a row.
    TryMax,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::Full => write!(f, "queue is full"),
            QueueError::Again => write!(f, "slot not yet published, try again"),
            QueueError::TryMax => write!(f, "tail contention exceeded retry bound"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Cache-line padded wrapper to keep head and tail off the same line.
#[repr(C, align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

struct Slot<T> {
    ready: AtomicBool,
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Packed (version, index) pair: version in the high 32 bits.
#[inline]
fn pack(version: u32, index: u32) -> u64 {
    ((version as u64) << 32) | index as u64
}

#[inline]
fn unpack(v: u64) -> (u32, u32) {
    ((v >> 32) as u32, v as u32)
}

/// Bounded multi-producer single-consumer queue.
///
/// Any number of threads may call [`push`](Self::push); at most one thread
/// at a time may call [`pop`](Self::pop).
pub struct LockFreeQueue<T: Serial> {
    slots: Box<[Slot<T>]>,
    head: CachePadded<AtomicU64>,
    tail: CachePadded<AtomicU64>,
    capacity: u32,
}

unsafe impl<T: Serial + Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Serial + Send> Sync for LockFreeQueue<T> {}

impl<T: Serial> LockFreeQueue<T> {
    /// Creates a queue holding up to `capacity - 1` records (one slot is
    /// sacrificed to tell full from empty).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity >= 2 && capacity <= u32::MAX as usize);
        let slots = (0..capacity)
            .map(|_| Slot {
                ready: AtomicBool::new(false),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            head: CachePadded { value: AtomicU64::new(0) },
            tail: CachePadded { value: AtomicU64::new(0) },
            capacity: capacity as u32,
        }
    }

    /// Claims a slot and publishes `value`. Callable from any thread.
    pub fn push(&self, value: T) -> Result<(), QueueError> {
        let mut tries = 0u32;
        let claimed_index = loop {
            if tries >= MAX_TRY_TIMES {
                return Err(QueueError::TryMax);
            }
            tries += 1;

            let old = self.tail.load(Ordering::Relaxed);
            let (version, index) = unpack(old);
            let (_, head_index) = unpack(self.head.load(Ordering::Acquire));
            if (index + 1) % self.capacity == head_index {
                return Err(QueueError::Full);
            }

            let new = pack(version.wrapping_add(1), (index + 1) % self.capacity);
            if self
                .tail
                .compare_exchange_weak(old, new, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                break index;
            }
        };

        let slot = &self.slots[claimed_index as usize];
        unsafe {
            (*slot.value.get()).write(value);
        }
        slot.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Removes the oldest record. `Ok(None)` when the queue is empty;
    /// `Err(Again)` when the head slot is claimed but not yet published.
    /// Must only be called from the single consumer.
    pub fn pop(&self) -> Result<Option<T>, QueueError> {
        let old = self.head.load(Ordering::Acquire);
        let (version, index) = unpack(old);
        let (_, tail_index) = unpack(self.tail.load(Ordering::Acquire));
        if index == tail_index {
            return Ok(None);
        }

        let slot = &self.slots[index as usize];
        if !slot.ready.load(Ordering::Acquire) {
            return Err(QueueError::Again);
        }

        let value = unsafe { (*slot.value.get()).assume_init_read() };
        slot.ready.store(false, Ordering::Release);
        self.head.store(
            pack(version.wrapping_add(1), (index + 1) % self.capacity),
            Ordering::Release,
        );
        Ok(Some(value))
    }

    /// Approximate number of records (exact when quiescent).
    pub fn len(&self) -> usize {
        let (_, head) = unpack(self.head.load(Ordering::Acquire));
        let (_, tail) = unpack(self.tail.load(Ordering::Acquire));
        ((tail + self.capacity - head) % self.capacity) as usize
    }

    /// True when no record is visible.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot count (usable capacity is one less).
    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn fifo_single_thread() {
        let q = LockFreeQueue::<u64>::with_capacity(8);
        for v in 0..7u64 {
            q.push(v).unwrap();
        }
        assert_eq!(q.push(7), Err(QueueError::Full));
        for v in 0..7u64 {
            assert_eq!(q.pop().unwrap(), Some(v));
        }
        assert_eq!(q.pop().unwrap(), None);
    }

    #[test]
    fn no_spurious_full_below_capacity() {
        let q = LockFreeQueue::<u32>::with_capacity(128);
        for round in 0..10 {
            for v in 0..100u32 {
                assert!(q.push(round * 100 + v).is_ok(), "len {} < 127", q.len());
            }
            while q.pop().unwrap().is_some() {}
        }
    }

    #[test]
    fn contended_producers_preserve_multiset() {
        // 4 producers push disjoint ranges, 1 consumer drains.
        let q = Arc::new(LockFreeQueue::<u64>::with_capacity(128));
        let producers: Vec<_> = (0..4u64)
            .map(|t| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    for i in 0..25u64 {
                        let v = t * 1000 + i;
                        loop {
                            match q.push(v) {
                                Ok(()) => break,
                                Err(QueueError::Full) | Err(QueueError::TryMax) => {
                                    std::thread::yield_now()
                                }
                                Err(e) => panic!("unexpected push error: {}", e),
                            }
                        }
                    }
                })
            })
            .collect();

        let mut popped = Vec::new();
        while popped.len() < 100 {
            match q.pop() {
                Ok(Some(v)) => popped.push(v),
                Ok(None) | Err(QueueError::Again) => std::thread::yield_now(),
                Err(e) => panic!("unexpected pop error: {}", e),
            }
        }
        for p in producers {
            p.join().unwrap();
        }

        popped.sort_unstable();
        let mut expected: Vec<u64> =
            (0..4u64).flat_map(|t| (0..25u64).map(move |i| t * 1000 + i)).collect();
        expected.sort_unstable();
        assert_eq!(popped, expected);
        assert_eq!(q.pop().unwrap(), None);
    }
}
