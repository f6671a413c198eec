//! Crash-fingerprint watchdog.
//!
//! A 4 KiB memory-mapped file holds the `(gid, seq_id, cmd)` triple of the
//! frame currently being processed. The dispatcher marks the triple before
//! invoking a handler and clears it after the frame is fully processed, so
//! a crash mid-handler leaves the triple behind; on restart, the one frame
//! matching the persisted triple is dropped instead of crashing the new
//! instance the same way.

use std::io;
use std::path::Path;

use shmpool::FileRegion;

/// Mapped region size.
pub const GUARD_REGION_BYTES: usize = 4096;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct GuardRecord {
    gid: u64,
    seq_id: u64,
    cmd: u32,
}

/// The persisted fingerprint record.
pub struct CrashGuard {
    region: FileRegion,
}

impl CrashGuard {
    /// Maps (creating if absent) the fingerprint file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let (region, _existed) = unsafe { FileRegion::create_or_open(path, GUARD_REGION_BYTES)? };
        Ok(Self { region })
    }

    fn read(&self) -> GuardRecord {
        unsafe { std::ptr::read_volatile(self.region.as_ptr().cast::<GuardRecord>()) }
    }

    fn write(&self, record: GuardRecord) {
        unsafe { std::ptr::write_volatile(self.region.as_ptr().cast::<GuardRecord>(), record) }
    }

    /// Compares the frame's triple against the persisted one. A match means
    /// this exact frame crashed the previous instance: the caller must drop
    /// it. Otherwise the triple is persisted as the one now in flight.
    ///
    /// Returns `false` on a match (drop the frame), `true` to proceed.
    pub fn check_and_mark(&self, gid: u64, seq_id: u64, cmd: u32) -> bool {
        let stored = self.read();
        let is_poison = stored != GuardRecord::default()
            && stored.gid == gid
            && stored.seq_id == seq_id
            && stored.cmd == cmd;
        if is_poison {
            return false;
        }
        self.write(GuardRecord { gid, seq_id, cmd });
        true
    }

    /// Clears the in-flight record; called once a frame is fully processed.
    pub fn clear(&self) {
        self.write(GuardRecord::default());
    }

    /// The persisted triple, for diagnostics.
    pub fn load(&self) -> (u64, u64, u32) {
        let r = self.read();
        (r.gid, r.seq_id, r.cmd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_guard_passes_and_marks() {
        let dir = tempfile::tempdir().unwrap();
        let guard = CrashGuard::open(&dir.path().join("guard")).unwrap();
        assert!(guard.check_and_mark(1, 2, 3));
        assert_eq!(guard.load(), (1, 2, 3));
        guard.clear();
        assert_eq!(guard.load(), (0, 0, 0));
    }

    #[test]
    fn persisted_triple_survives_reopen_and_drops_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("guard");

        {
            let guard = CrashGuard::open(&path).unwrap();
            assert!(guard.check_and_mark(7, 8, 9));
            // Simulated crash: no clear.
        }

        let guard = CrashGuard::open(&path).unwrap();
        assert_eq!(guard.load(), (7, 8, 9));
        assert!(!guard.check_and_mark(7, 8, 9), "the poison frame is dropped");
        guard.clear();
        assert!(guard.check_and_mark(7, 8, 9), "same triple passes after clear");
    }

    #[test]
    fn different_triple_overwrites_mark() {
        let dir = tempfile::tempdir().unwrap();
        let guard = CrashGuard::open(&dir.path().join("guard")).unwrap();
        assert!(guard.check_and_mark(1, 1, 1));
        assert!(guard.check_and_mark(2, 2, 2), "different frame passes");
        assert_eq!(guard.load(), (2, 2, 2));
    }
}
