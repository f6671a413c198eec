//! Request scheduler contract and the default FIFO implementation.
//!
//! A scheduler sits between frame reception and handler dispatch: decoded
//! request frames are parked with their transport tag and drained by the
//! loop under the flow-control budget. Ordering is whatever the scheduler
//! provides; the default is plain FIFO over a [`VarRing`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use shmpool::VarRing;
use tracing::warn;

/// Dequeue processor: `(gid, record bytes, tag) -> handled`.
pub type ProcFn = Box<dyn Fn(u64, &[u8], u64) -> bool>;

/// Queues work between reception and dispatch.
pub trait Scheduler {
    /// Installs the dequeue processor. Called once by the loop when the
    /// scheduler is attached.
    fn set_proc(&self, proc_fn: ProcFn);

    /// Parks one request. `tag` distinguishes the source (transport index or
    /// the timed-event tag). `false` means the request was rejected.
    fn on_request(&self, seq: u64, gid: u64, data: &[u8], tag: u64) -> bool;

    /// Signals that a parked request finished processing.
    fn on_response(&self, gid: u64);

    /// Drains up to `proc_num` requests (0 = all). Returns how many ran.
    fn loop_once(&self, proc_num: u32) -> u32;

    /// Parked requests attributable to `gid`.
    fn cache_num(&self, gid: u64) -> usize;

    /// Tells the scheduler the engine is stopping.
    fn set_stop(&self, stop: bool);

    fn is_stop(&self) -> bool;
}

// Parked record framing: seq u64 | gid u64 | tag u64 | payload.
const ITEM_HDR: usize = 24;

/// FIFO scheduler storing parked records in a variable-record ring.
pub struct FifoScheduler {
    ring: RefCell<VarRing>,
    proc_fn: RefCell<Option<ProcFn>>,
    per_gid: RefCell<HashMap<u64, usize>>,
    stop: Cell<bool>,
}

impl FifoScheduler {
    /// `buffer_bytes` bounds the total parked bytes (records + framing).
    pub fn new(buffer_bytes: usize) -> shmpool::Result<Self> {
        Ok(Self {
            ring: RefCell::new(VarRing::with_capacity(buffer_bytes)?),
            proc_fn: RefCell::new(None),
            per_gid: RefCell::new(HashMap::new()),
            stop: Cell::new(false),
        })
    }

    fn encode(seq: u64, gid: u64, tag: u64, data: &[u8]) -> Vec<u8> {
        let mut rec = Vec::with_capacity(ITEM_HDR + data.len());
        rec.extend_from_slice(&seq.to_le_bytes());
        rec.extend_from_slice(&gid.to_le_bytes());
        rec.extend_from_slice(&tag.to_le_bytes());
        rec.extend_from_slice(data);
        rec
    }

    fn decode(rec: &[u8]) -> Option<(u64, u64, u64, &[u8])> {
        if rec.len() < ITEM_HDR {
            return None;
        }
        let seq = u64::from_le_bytes(rec[0..8].try_into().ok()?);
        let gid = u64::from_le_bytes(rec[8..16].try_into().ok()?);
        let tag = u64::from_le_bytes(rec[16..24].try_into().ok()?);
        Some((seq, gid, tag, &rec[ITEM_HDR..]))
    }
}

impl Scheduler for FifoScheduler {
    fn set_proc(&self, proc_fn: ProcFn) {
        *self.proc_fn.borrow_mut() = Some(proc_fn);
    }

    fn on_request(&self, seq: u64, gid: u64, data: &[u8], tag: u64) -> bool {
        if self.stop.get() {
            return false;
        }
        let rec = Self::encode(seq, gid, tag, data);
        if !self.ring.borrow_mut().push(&rec, false) {
            return false;
        }
        *self.per_gid.borrow_mut().entry(gid).or_default() += 1;
        true
    }

    fn on_response(&self, gid: u64) {
        let mut per_gid = self.per_gid.borrow_mut();
        if let Some(count) = per_gid.get_mut(&gid) {
            *count -= 1;
            if *count == 0 {
                per_gid.remove(&gid);
            }
        }
    }

    fn loop_once(&self, proc_num: u32) -> u32 {
        let mut dealt = 0u32;
        loop {
            if proc_num != 0 && dealt >= proc_num {
                break;
            }
            let rec = match self.ring.borrow_mut().pop() {
                Some(rec) => rec,
                None => break,
            };
            let Some((_seq, gid, tag, payload)) = Self::decode(&rec) else {
                warn!(len = rec.len(), "malformed scheduler record dropped");
                continue;
            };
            let proc_fn = self.proc_fn.borrow();
            match proc_fn.as_ref() {
                Some(f) => {
                    f(gid, payload, tag);
                }
                None => {
                    warn!("scheduler drained without a processor");
                }
            }
            dealt += 1;
        }
        dealt
    }

    fn cache_num(&self, gid: u64) -> usize {
        self.per_gid.borrow().get(&gid).copied().unwrap_or(0)
    }

    fn set_stop(&self, stop: bool) {
        self.stop.set(stop);
    }

    fn is_stop(&self) -> bool {
        self.stop.get()
    }
}
