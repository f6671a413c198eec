//! shmpool - intrusive fixed-capacity containers over raw memory regions.
//!
//! Every container in this crate lays out all of its state (header, link
//! tables, bucket arrays, slot payloads) inside a single contiguous memory
//! region. The region can be:
//!
//! - owned by the container (`with_capacity`, a heap allocation), or
//! - a shared-memory segment or memory-mapped file (`init_*` / `attach_*`),
//!   in which case the state survives process restart and `attach` validates
//!   the header (magic, version, element size, capacity, offsets) before
//!   touching anything.
//!
//! Element types are gated by the [`Serial`] marker trait: plain `Copy` data
//! with a stable byte layout. Slots are addressed by 1-based `u32` handles
//! (0 is the null handle); handles stay valid until the slot is freed.
//!
//! Container family:
//!
//! - [`FixedPool`]: free-list allocator with an intrusive active list
//! - [`HashPool`]: `FixedPool` plus hash buckets for keyed lookup
//! - [`MemSet`] / [`MemMap`]: set/map facades over `HashPool`
//! - [`MemLruSet`] / [`MemLruMap`]: keyed storage with a recency chain
//! - [`MemList`]: ordered list over pool slots
//! - [`FixedRing`]: fixed-record ring buffer
//! - [`VarRing`]: variable-record ring buffer with padding framing
//! - [`LockFreeQueue`]: bounded MPSC queue for cross-thread hand-off

pub mod error;
pub mod fixed_pool;
pub mod fixed_ring;
pub mod hash_pool;
pub mod lockfree;
pub mod mem_list;
pub mod mem_lru;
pub mod mem_map;
pub mod region;
pub mod serial;
pub mod var_ring;

pub use error::{Error, Result};
pub use fixed_pool::FixedPool;
pub use fixed_ring::FixedRing;
pub use hash_pool::HashPool;
pub use lockfree::{LockFreeQueue, QueueError};
pub use mem_list::MemList;
pub use mem_lru::{MemLruMap, MemLruSet};
pub use mem_map::{MemMap, MemSet};
pub use region::{FileRegion, SharedMemory};
pub use serial::Serial;
pub use var_ring::VarRing;

/// Null handle: no container ever hands out slot 0.
pub const NULL_HANDLE: u32 = 0;
