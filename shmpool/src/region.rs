//! Memory regions backed by POSIX shared memory or memory-mapped files.
//!
//! Both region kinds close their file descriptor as soon as the mapping is
//! established; the mapping outlives the descriptor. `Drop` unmaps, and a
//! creating owner of a `SharedMemory` additionally unlinks the name.

use std::ffi::CString;
use std::io;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::path::Path;
use std::ptr::NonNull;

use nix::fcntl::OFlag;
use nix::sys::mman::{mmap, msync, munmap, shm_open, shm_unlink, MapFlags, MsFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::ftruncate;

fn errno_to_io(e: nix::errno::Errno) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn map_fd<F: AsFd>(fd: &F, len: usize) -> io::Result<NonNull<u8>> {
    let len = NonZeroUsize::new(len)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "length must be non-zero"))?;
    let ptr = unsafe {
        mmap(
            None,
            len,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd,
            0,
        )
    }
    .map_err(errno_to_io)?;
    Ok(unsafe { NonNull::new_unchecked(ptr.as_ptr().cast()) })
}

/// A named region in `/dev/shm`.
pub struct SharedMemory {
    ptr: NonNull<u8>,
    len: usize,
    name: CString,
    is_owner: bool,
}

unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Creates a new named region. The caller becomes the owner; the name is
    /// unlinked when the owner drops.
    ///
    /// # Safety
    ///
    /// No other live mapping of `name` may assume a different size or layout.
    pub unsafe fn create(name: &str, len: usize) -> io::Result<Self> {
        let cname = shm_name(name)?;
        let fd = shm_open(
            cname.as_c_str(),
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::S_IRUSR | Mode::S_IWUSR,
        )
        .map_err(errno_to_io)?;

        if let Err(e) = ftruncate(&fd, len as i64) {
            let _ = shm_unlink(cname.as_c_str());
            return Err(errno_to_io(e));
        }

        let ptr = match map_fd(&fd, len) {
            Ok(p) => p,
            Err(e) => {
                let _ = shm_unlink(cname.as_c_str());
                return Err(e);
            }
        };

        Ok(Self { ptr, len, name: cname, is_owner: true })
    }

    /// Opens an existing named region of exactly `len` bytes.
    ///
    /// # Safety
    ///
    /// The region must exist with at least `len` bytes and must hold (or be
    /// about to receive) a layout compatible with how the caller uses it.
    pub unsafe fn open(name: &str, len: usize) -> io::Result<Self> {
        let cname = shm_name(name)?;
        let fd = shm_open(cname.as_c_str(), OFlag::O_RDWR, Mode::empty()).map_err(errno_to_io)?;
        let ptr = map_fd(&fd, len)?;
        Ok(Self { ptr, len, name: cname, is_owner: false })
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the mapping is zero-sized (never, in practice).
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
        if self.is_owner {
            let _ = shm_unlink(self.name.as_c_str());
        }
    }
}

fn shm_name(name: &str) -> io::Result<CString> {
    let name = if name.starts_with('/') { name.to_string() } else { format!("/{}", name) };
    CString::new(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "name contains a null byte"))
}

/// A file-backed region.
pub struct FileRegion {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for FileRegion {}

impl FileRegion {
    /// Opens `path` (creating it and any missing parent directory if needed),
    /// grows it to `len` bytes when freshly created, and maps it.
    ///
    /// Returns the region and whether the file already held data (a non-zero
    /// size before this call).
    ///
    /// # Safety
    ///
    /// No other mapping of `path` may assume an incompatible size or layout.
    pub unsafe fn create_or_open(path: &Path, len: usize) -> io::Result<(Self, bool)> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let existed = file.metadata()?.len() != 0;
        if !existed {
            file.set_len(len as u64)?;
        }

        let ptr = map_fd(&file, len)?;
        Ok((Self { ptr, len }, existed))
    }

    /// Base pointer of the mapping.
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Size of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when the mapping is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Flushes the mapping back to the file.
    pub fn sync(&self) -> io::Result<()> {
        unsafe { msync(self.ptr.cast(), self.len, MsFlags::MS_SYNC) }.map_err(errno_to_io)
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = munmap(self.ptr.cast(), self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_memory_create_open_roundtrip() {
        let name = format!("/shmpool_region_{}", std::process::id());
        unsafe {
            let a = SharedMemory::create(&name, 4096).unwrap();
            std::ptr::write_volatile(a.as_ptr(), 0xA5u8);

            let b = SharedMemory::open(&name, 4096).unwrap();
            assert_eq!(std::ptr::read_volatile(b.as_ptr()), 0xA5u8);
            drop(b);
            drop(a);
        }
    }

    #[test]
    fn file_region_reports_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region.bin");
        unsafe {
            let (r, existed) = FileRegion::create_or_open(&path, 4096).unwrap();
            assert!(!existed);
            std::ptr::write_volatile(r.as_ptr(), 7u8);
            r.sync().unwrap();
            drop(r);

            let (r, existed) = FileRegion::create_or_open(&path, 4096).unwrap();
            assert!(existed);
            assert_eq!(std::ptr::read_volatile(r.as_ptr()), 7u8);
        }
    }
}
