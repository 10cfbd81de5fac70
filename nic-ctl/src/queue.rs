//! Queue objects.

use crate::Result;
use crate::hw::HwQueue;
use crate::mr::{MR_CACHE_QUEUE_N, MrCache};
use crate::ring::{DescRing, PacketDesc};

/// Queue direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Rx,
    Tx,
}

/// One receive or transmit queue: a descriptor ring plus a per-queue memory
/// registration cache for fast-path lookups.
///
/// During steady state a queue is owned by exactly one worker, so nothing in
/// here is synchronized. Queues carry no back-reference to their device;
/// callers index the device's queue table instead.
#[derive(Debug)]
pub struct Queue {
    id: u16,
    dir: Direction,
    socket: u32,
    ring: DescRing<PacketDesc>,
    mr_cache: MrCache,
    hw_queue: Option<HwQueue>,
}

impl Queue {
    pub(crate) fn new(id: u16, dir: Direction, depth: u16, socket: u32) -> Result<Self> {
        let ring = DescRing::new(depth)?;
        tracing::debug!(id, ?dir, depth, socket, "queue allocated");
        Ok(Self {
            id,
            dir,
            socket,
            ring,
            mr_cache: MrCache::new(MR_CACHE_QUEUE_N),
            hw_queue: None,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn direction(&self) -> Direction {
        self.dir
    }

    /// Memory affinity domain the queue was set up for.
    pub fn socket(&self) -> u32 {
        self.socket
    }

    pub fn depth(&self) -> u32 {
        self.ring.depth()
    }

    /// Whether the hardware counterpart currently exists.
    pub fn is_started(&self) -> bool {
        self.hw_queue.is_some()
    }

    pub fn ring(&self) -> &DescRing<PacketDesc> {
        &self.ring
    }

    pub fn ring_mut(&mut self) -> &mut DescRing<PacketDesc> {
        &mut self.ring
    }

    pub fn mr_cache(&self) -> &MrCache {
        &self.mr_cache
    }

    pub(crate) fn mr_cache_mut(&mut self) -> &mut MrCache {
        &mut self.mr_cache
    }

    pub(crate) fn hw_queue(&self) -> Option<HwQueue> {
        self.hw_queue
    }

    pub(crate) fn set_hw_queue(&mut self, hw_queue: Option<HwQueue>) {
        self.hw_queue = hw_queue;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_queue_is_stopped_and_empty() {
        let q = Queue::new(0, Direction::Rx, 128, 0).unwrap();
        assert!(!q.is_started());
        assert!(q.ring().is_empty());
        assert!(q.mr_cache().is_empty());
        assert_eq!(q.depth(), 128);
    }

    #[test]
    fn zero_depth_is_rejected() {
        assert!(Queue::new(0, Direction::Tx, 0, 0).is_err());
    }
}
