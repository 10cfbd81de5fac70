//! Hardware transport provider seam.
//!
//! The control plane drives the device exclusively through [`HwProvider`]; it
//! never touches registers or command queues itself. Handles are opaque to
//! the core, which only stores and returns them.

use std::os::fd::RawFd;

use crate::Result;
use crate::queue::Direction;

/// Opaque handle to an opened device context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwDevice(pub u64);

/// Opaque protection domain scoping memory registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProtectionDomain(pub u64);

/// Opaque hardware queue handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HwQueue(pub u64);

/// Opaque memory registration handle granting the device DMA access to a
/// virtual address range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MrHandle(pub u64);

/// A virtual address range `[base, base + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemRange {
    pub base: u64,
    pub len: u64,
}

impl MemRange {
    pub fn new(base: u64, len: u64) -> Self {
        Self { base, len }
    }

    /// One past the last covered address.
    pub fn end(&self) -> u64 {
        self.base + self.len
    }

    /// Whether `[addr, addr + len)` lies fully inside this range.
    pub fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.base && addr.saturating_add(len) <= self.end()
    }

    pub fn overlaps(&self, other: &MemRange) -> bool {
        self.base < other.end() && other.base < self.end()
    }
}

/// Device limits reported at open time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceCaps {
    pub max_queues: u16,
    pub max_desc: u16,
    pub max_sge: u16,
    pub max_mr: u32,
    pub max_mr_size: u64,
}

/// Classification of an asynchronous device event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The device is gone or unusable; the port must report removal.
    DeviceFatal,
    PortStateChange,
    Other,
}

/// One event fetched from the device's async event source.
#[derive(Debug, Clone, Copy)]
pub struct AsyncEvent {
    pub kind: EventKind,
    pub seq: u64,
}

/// The command interface of the device.
///
/// Implementations must be callable from multiple threads; the control plane
/// shares one provider across the dispatcher thread and the caller.
pub trait HwProvider: Send + Sync {
    fn open_device(&self) -> Result<HwDevice>;
    fn close_device(&self, dev: HwDevice) -> Result<()>;
    fn query_caps(&self, dev: HwDevice) -> Result<DeviceCaps>;

    fn alloc_pd(&self, dev: HwDevice) -> Result<ProtectionDomain>;
    fn dealloc_pd(&self, pd: ProtectionDomain) -> Result<()>;

    fn register_memory(&self, pd: ProtectionDomain, range: MemRange) -> Result<MrHandle>;
    fn deregister_memory(&self, mr: MrHandle) -> Result<()>;

    fn create_queue(&self, dev: HwDevice, dir: Direction, depth: u16) -> Result<HwQueue>;
    fn destroy_queue(&self, queue: HwQueue) -> Result<()>;
    fn activate_queue(&self, queue: HwQueue) -> Result<()>;
    fn deactivate_queue(&self, queue: HwQueue) -> Result<()>;

    /// The fd that becomes readable when async events are pending. Owned by
    /// the provider; it stays valid until the device is closed.
    fn event_fd(&self, dev: HwDevice) -> Result<RawFd>;
    /// Fetch one pending async event, or `None` once the source is drained.
    fn fetch_event(&self, dev: HwDevice) -> Result<Option<AsyncEvent>>;
    /// Acknowledge a previously fetched event.
    fn ack_event(&self, dev: HwDevice, event: AsyncEvent) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_range_containment() {
        let r = MemRange::new(0x1000, 0x1000);
        assert!(r.covers(0x1000, 0x1000));
        assert!(r.covers(0x1800, 0x100));
        assert!(!r.covers(0xfff, 2));
        assert!(!r.covers(0x1fff, 2));
        assert!(!r.covers(u64::MAX, 1));
    }

    #[test]
    fn mem_range_overlap() {
        let r = MemRange::new(0x1000, 0x1000);
        assert!(r.overlaps(&MemRange::new(0x1800, 0x1000)));
        assert!(!r.overlaps(&MemRange::new(0x2000, 0x1000)));
        assert!(!r.overlaps(&MemRange::new(0, 0x1000)));
    }
}
