//! Fixed-capacity descriptor rings.

use crate::{Error, Result};

/// A packet descriptor handed through a queue's ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketDesc {
    pub addr: u64,
    pub len: u32,
}

/// Single-owner ring with `head`/`tail` indices in `[0, depth)` and an
/// occupancy count. `post` writes at `head`, `consume` reads at `tail`,
/// both wrapping modulo `depth`. A full ring rejects the post; an
/// unconsumed slot is never overwritten.
#[derive(Debug)]
pub struct DescRing<T> {
    slots: Box<[Option<T>]>,
    head: u32,
    tail: u32,
    used: u32,
}

impl<T> DescRing<T> {
    pub fn new(depth: u16) -> Result<Self> {
        if depth == 0 {
            return Err(Error::InvalidConfiguration(
                "ring depth must be non-zero".into(),
            ));
        }
        let mut slots = Vec::new();
        slots.try_reserve_exact(depth as usize).map_err(|_| {
            Error::OutOfResources(format!("ring of depth {depth}"))
        })?;
        slots.resize_with(depth as usize, || None);
        Ok(Self {
            slots: slots.into_boxed_slice(),
            head: 0,
            tail: 0,
            used: 0,
        })
    }

    pub fn depth(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn len(&self) -> u32 {
        self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    pub fn is_full(&self) -> bool {
        self.used == self.depth()
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    /// Post a descriptor at `head`. Returns the descriptor when the ring is
    /// full.
    pub fn post(&mut self, desc: T) -> std::result::Result<(), T> {
        if self.is_full() {
            return Err(desc);
        }
        let slot = &mut self.slots[self.head as usize];
        debug_assert!(slot.is_none());
        *slot = Some(desc);
        self.head = (self.head + 1) % self.depth();
        self.used += 1;
        Ok(())
    }

    /// Take the descriptor at `tail`, or `None` when the ring is empty.
    pub fn consume(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let desc = self.slots[self.tail as usize].take();
        debug_assert!(desc.is_some());
        self.tail = (self.tail + 1) % self.depth();
        self.used -= 1;
        desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_depth() {
        assert!(DescRing::<u32>::new(0).is_err());
    }

    #[test]
    fn post_until_full_then_consume() {
        let mut ring = DescRing::new(4).unwrap();
        for i in 0..4u32 {
            ring.post(i).unwrap();
        }
        assert!(ring.is_full());
        assert_eq!(ring.post(99), Err(99));
        for i in 0..4u32 {
            assert_eq!(ring.consume(), Some(i));
        }
        assert!(ring.is_empty());
        assert_eq!(ring.consume(), None);
    }

    #[test]
    fn interleaved_wrap_keeps_indices_in_range() {
        let mut ring = DescRing::new(3).unwrap();
        let mut next = 0u32;
        let mut expect = 0u32;
        // Uneven post/consume mix forcing many wraps.
        for step in 0..200 {
            let posts = 1 + (step % 3);
            for _ in 0..posts {
                if ring.post(next).is_ok() {
                    next += 1;
                }
            }
            let consumes = 1 + (step % 2);
            for _ in 0..consumes {
                if let Some(v) = ring.consume() {
                    assert_eq!(v, expect);
                    expect += 1;
                }
            }
            assert!(ring.head() < ring.depth());
            assert!(ring.tail() < ring.depth());
            assert!(ring.len() <= ring.depth());
        }
        while let Some(v) = ring.consume() {
            assert_eq!(v, expect);
            expect += 1;
        }
        assert_eq!(expect, next);
    }
}
