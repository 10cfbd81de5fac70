//! Shared coordination segment.
//!
//! A fixed-layout record placed in a named POSIX shared memory object, mapped
//! by every process attached to the same device. A process-shared spinlock
//! lives inside the mapping and guards the init flag and the attach
//! refcounts. The first process to attach creates the segment; the name is
//! removed when the last primary detaches.

use std::mem::size_of;
use std::num::NonZeroUsize;
use std::os::fd::OwnedFd;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, Ordering};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::libc::{c_void, off_t};
use nix::sys::mman::{self, MapFlags, ProtFlags};
use nix::sys::stat::Mode;
use nix::unistd::{self, SysconfVar};

use crate::{Error, Result};

/// Spinlock usable across processes: the word lives inside a MAP_SHARED
/// mapping and the zero bit pattern is the unlocked state, so a freshly
/// ftruncate'd segment starts unlocked.
#[repr(C)]
pub struct ShmSpinLock {
    locked: AtomicU32,
}

impl ShmSpinLock {
    pub fn lock(&self) -> ShmGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
        ShmGuard { lock: self }
    }
}

/// Holding one proves the segment lock is held.
pub struct ShmGuard<'a> {
    lock: &'a ShmSpinLock,
}

impl Drop for ShmGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(0, Ordering::Release);
    }
}

/// The coordination record. All-zeroes is the valid initial state, which is
/// exactly what a fresh segment contains. Counters move only under the lock;
/// a counter that would go negative is an impossible state and panics.
#[repr(C)]
pub struct SharedCoordState {
    lock: ShmSpinLock,
    init_done: AtomicU32,
    primary_cnt: AtomicU32,
    secondary_cnt: AtomicU32,
}

impl SharedCoordState {
    pub fn lock(&self) -> ShmGuard<'_> {
        self.lock.lock()
    }

    pub fn init_done(&self, _held: &ShmGuard<'_>) -> bool {
        self.init_done.load(Ordering::Relaxed) != 0
    }

    pub fn set_init_done(&self, _held: &ShmGuard<'_>) {
        self.init_done.store(1, Ordering::Relaxed);
    }

    pub fn primary_cnt(&self, _held: &ShmGuard<'_>) -> u32 {
        self.primary_cnt.load(Ordering::Relaxed)
    }

    pub fn secondary_cnt(&self, _held: &ShmGuard<'_>) -> u32 {
        self.secondary_cnt.load(Ordering::Relaxed)
    }

    /// Count one primary attach; returns the new count.
    pub fn inc_primary(&self, _held: &ShmGuard<'_>) -> u32 {
        self.primary_cnt.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Drop one primary attach; returns the new count. Panics on underflow.
    pub fn dec_primary(&self, _held: &ShmGuard<'_>) -> u32 {
        let prev = self.primary_cnt.load(Ordering::Relaxed);
        assert!(prev > 0, "primary refcount underflow");
        self.primary_cnt.store(prev - 1, Ordering::Relaxed);
        prev - 1
    }

    pub fn inc_secondary(&self, _held: &ShmGuard<'_>) -> u32 {
        self.secondary_cnt.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Panics on underflow.
    pub fn dec_secondary(&self, _held: &ShmGuard<'_>) -> u32 {
        let prev = self.secondary_cnt.load(Ordering::Relaxed);
        assert!(prev > 0, "secondary refcount underflow");
        self.secondary_cnt.store(prev - 1, Ordering::Relaxed);
        prev - 1
    }
}

/// One process's mapping of the named coordination segment.
pub struct SharedSegment {
    name: String,
    _fd: OwnedFd,
    ptr: NonNull<c_void>,
    len: usize,
    created: bool,
}

// The mapping is owned for the life of self and only ever read through
// &SharedCoordState, whose fields are atomics.
unsafe impl Send for SharedSegment {}
unsafe impl Sync for SharedSegment {}

impl SharedSegment {
    /// Create the named segment, or attach when another process got there
    /// first. `created()` tells which happened.
    pub fn create_or_attach(name: &str) -> Result<Self> {
        let len = size_of::<SharedCoordState>();
        let create_flags = OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR;
        let mode = Mode::S_IRUSR | Mode::S_IWUSR;
        let (fd, created) = match mman::shm_open(name, create_flags, mode) {
            Ok(fd) => (fd, true),
            Err(Errno::EEXIST) => {
                let fd = mman::shm_open(name, OFlag::O_RDWR, Mode::empty())
                    .map_err(|e| Error::OutOfResources(format!("attach segment {name}: {e}")))?;
                (fd, false)
            }
            Err(e) => {
                return Err(Error::OutOfResources(format!("create segment {name}: {e}")));
            }
        };
        if created && let Err(e) = unistd::ftruncate(&fd, len as off_t) {
            let _ = mman::shm_unlink(name);
            return Err(Error::OutOfResources(format!("size segment {name}: {e}")));
        }
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            Error::OutOfResources("coordination record is zero-sized".into())
        })?;
        let ptr = match unsafe {
            mman::mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &fd,
                0,
            )
        } {
            Ok(ptr) => ptr,
            Err(e) => {
                if created {
                    let _ = mman::shm_unlink(name);
                }
                return Err(Error::OutOfResources(format!("map segment {name}: {e}")));
            }
        };
        tracing::debug!(name, created, "coordination segment mapped");
        Ok(Self {
            name: name.to_string(),
            _fd: fd,
            ptr,
            len,
            created,
        })
    }

    /// Whether this mapping created the segment.
    pub fn created(&self) -> bool {
        self.created
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> &SharedCoordState {
        // The mapping is page-aligned, read-write, at least one record long,
        // and all-zeroes is a valid record.
        unsafe { &*(self.ptr.as_ptr() as *const SharedCoordState) }
    }

    /// Remove the name so no further process can attach. Existing mappings
    /// stay valid until unmapped.
    pub fn unlink(&self) -> Result<()> {
        mman::shm_unlink(self.name.as_str())?;
        tracing::debug!(name = %self.name, "coordination segment unlinked");
        Ok(())
    }
}

impl Drop for SharedSegment {
    fn drop(&mut self) {
        // Unmap only; the name is removed by the last primary via unlink().
        let _ = unsafe { mman::munmap(self.ptr, self.len) };
    }
}

/// System page size, for mapping single-page resources such as the doorbell.
pub fn page_size() -> usize {
    unistd::sysconf(SysconfVar::PAGE_SIZE)
        .ok()
        .flatten()
        .map(|v| v as usize)
        .unwrap_or(4096)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    fn unique_name(tag: &str) -> String {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        format!(
            "/nic_ctl_shm_test_{}_{}_{}",
            tag,
            std::process::id(),
            SEQ.fetch_add(1, Ordering::Relaxed)
        )
    }

    #[test]
    fn create_then_attach_share_state() {
        let name = unique_name("share");
        let a = SharedSegment::create_or_attach(&name).unwrap();
        assert!(a.created());
        {
            let guard = a.state().lock();
            assert!(!a.state().init_done(&guard));
            assert_eq!(a.state().inc_primary(&guard), 1);
            a.state().set_init_done(&guard);
        }
        let b = SharedSegment::create_or_attach(&name).unwrap();
        assert!(!b.created());
        {
            let guard = b.state().lock();
            assert!(b.state().init_done(&guard));
            assert_eq!(b.state().primary_cnt(&guard), 1);
            assert_eq!(b.state().inc_secondary(&guard), 1);
        }
        {
            let guard = a.state().lock();
            assert_eq!(a.state().secondary_cnt(&guard), 1);
        }
        a.unlink().unwrap();
    }

    #[test]
    fn unlink_allows_fresh_creation() {
        let name = unique_name("unlink");
        let a = SharedSegment::create_or_attach(&name).unwrap();
        {
            let guard = a.state().lock();
            a.state().inc_primary(&guard);
        }
        a.unlink().unwrap();
        // The old mapping lives on, but the name is free again.
        let b = SharedSegment::create_or_attach(&name).unwrap();
        assert!(b.created());
        let guard = b.state().lock();
        assert_eq!(b.state().primary_cnt(&guard), 0);
        drop(guard);
        b.unlink().unwrap();
    }

    #[test]
    #[should_panic(expected = "primary refcount underflow")]
    fn decrement_below_zero_panics() {
        let name = unique_name("underflow");
        let seg = SharedSegment::create_or_attach(&name).unwrap();
        let _ = seg.unlink();
        let guard = seg.state().lock();
        seg.state().dec_primary(&guard);
    }
}
