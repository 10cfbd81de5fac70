//! Memory registration caches.
//!
//! Two tiers. Each queue carries a small cache owned by the worker driving
//! that queue, so fast-path lookups take no lock; the device carries one
//! canonical registry behind a mutex. Only the registry owns registrations:
//! an eviction from a per-queue cache drops a copy, an eviction from the
//! registry releases the handle back to the provider.

use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::Result;
use crate::hw::{HwProvider, MemRange, MrHandle, ProtectionDomain};

/// Capacity of the device-wide registry.
pub const MR_CACHE_DEV_N: usize = 1024;
/// Capacity of each per-queue cache.
pub const MR_CACHE_QUEUE_N: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct MrEntry {
    pub range: MemRange,
    pub handle: MrHandle,
    last_use: u64,
}

/// Bounded, address-ordered range cache with LRU replacement.
///
/// Ranges originate from fixed-extent pools and never overlap, so a lookup
/// is a single ordered search: the greatest stored base at or below the
/// address either contains the whole span or nothing does.
#[derive(Debug)]
pub struct MrCache {
    entries: BTreeMap<u64, MrEntry>,
    cap: usize,
    tick: u64,
}

impl MrCache {
    pub fn new(cap: usize) -> Self {
        assert!(cap > 0, "cache capacity must be non-zero");
        Self {
            entries: BTreeMap::new(),
            cap,
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Find a stored range containing `[addr, addr + len)`, bumping its
    /// recency on a hit.
    pub fn lookup(&mut self, addr: u64, len: u64) -> Option<MrHandle> {
        self.tick += 1;
        let tick = self.tick;
        let (_, entry) = self.entries.range_mut(..=addr).next_back()?;
        if entry.range.covers(addr, len) {
            entry.last_use = tick;
            Some(entry.handle)
        } else {
            None
        }
    }

    /// Insert a range, evicting the least-recently-used entry when at
    /// capacity. The caller decides whether the returned eviction releases
    /// its registration.
    pub fn insert(&mut self, range: MemRange, handle: MrHandle) -> Option<MrEntry> {
        debug_assert!(
            self.entries.values().all(|e| !e.range.overlaps(&range)),
            "ranges must not overlap"
        );
        let evicted = if self.entries.len() >= self.cap {
            self.evict_one()
        } else {
            None
        };
        self.tick += 1;
        self.entries.insert(
            range.base,
            MrEntry {
                range,
                handle,
                last_use: self.tick,
            },
        );
        evicted
    }

    /// Remove and return the least-recently-used entry.
    pub fn evict_one(&mut self) -> Option<MrEntry> {
        let base = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_use)
            .map(|(base, _)| *base)?;
        self.entries.remove(&base)
    }

    /// Drop every entry, returning them for release.
    pub fn clear(&mut self) -> Vec<MrEntry> {
        let drained = self.entries.values().copied().collect();
        self.entries.clear();
        drained
    }
}

/// Device-wide canonical registry. Owns every registration it holds and
/// releases them back to the provider on eviction and on [`clear`].
///
/// [`clear`]: MrRegistry::clear
pub struct MrRegistry {
    cache: Mutex<MrCache>,
}

impl MrRegistry {
    pub fn new(cap: usize) -> Self {
        Self {
            cache: Mutex::new(MrCache::new(cap)),
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().expect("mr registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, addr: u64, len: u64) -> Option<MrHandle> {
        self.cache
            .lock()
            .expect("mr registry lock poisoned")
            .lookup(addr, len)
    }

    /// Insert a fresh registration, releasing whatever it evicts.
    pub fn insert(&self, range: MemRange, handle: MrHandle, hw: &dyn HwProvider) -> Result<()> {
        let evicted = self
            .cache
            .lock()
            .expect("mr registry lock poisoned")
            .insert(range, handle);
        if let Some(entry) = evicted {
            tracing::debug!(
                base = entry.range.base,
                len = entry.range.len,
                "evicting least-recently-used memory registration"
            );
            hw.deregister_memory(entry.handle)?;
        }
        Ok(())
    }

    /// Release every outstanding registration. Legal only once the data path
    /// has stopped. Teardown is best effort; the first failure is surfaced
    /// after all entries have been attempted.
    pub fn clear(&self, hw: &dyn HwProvider) -> Result<()> {
        let entries = self
            .cache
            .lock()
            .expect("mr registry lock poisoned")
            .clear();
        let mut first_err = None;
        for entry in entries {
            if let Err(e) = hw.deregister_memory(entry.handle) {
                tracing::warn!(base = entry.range.base, "failed to deregister memory: {e}");
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Fast-path lookup: per-queue cache, then the device registry (copying the
/// hit into the per-queue cache), then a fresh registration with the
/// provider.
pub fn lookup_or_register(
    queue_cache: &mut MrCache,
    registry: &MrRegistry,
    hw: &dyn HwProvider,
    pd: ProtectionDomain,
    range: MemRange,
) -> Result<MrHandle> {
    if let Some(handle) = queue_cache.lookup(range.base, range.len) {
        return Ok(handle);
    }
    if let Some(handle) = registry.lookup(range.base, range.len) {
        // Per-queue caches hold copies; evicting one later releases nothing.
        queue_cache.insert(range, handle);
        return Ok(handle);
    }
    let handle = hw.register_memory(pd, range)?;
    tracing::debug!(base = range.base, len = range.len, "registered new memory range");
    registry.insert(range, handle, hw)?;
    queue_cache.insert(range, handle);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: u64) -> MemRange {
        MemRange::new(base * 0x10000, 0x10000)
    }

    #[test]
    fn lookup_hits_inside_range_only() {
        let mut cache = MrCache::new(4);
        cache.insert(range(1), MrHandle(1));
        assert_eq!(cache.lookup(0x10000, 0x10000), Some(MrHandle(1)));
        assert_eq!(cache.lookup(0x18000, 0x100), Some(MrHandle(1)));
        assert_eq!(cache.lookup(0x18000, 0x10000), None);
        assert_eq!(cache.lookup(0xffff, 1), None);
        assert_eq!(cache.lookup(0x20000, 1), None);
    }

    #[test]
    fn insert_beyond_capacity_evicts_lru() {
        let mut cache = MrCache::new(3);
        for i in 0..3 {
            assert!(cache.insert(range(i), MrHandle(i)).is_none());
        }
        // Touch 0 and 2 so range 1 is the LRU.
        cache.lookup(range(0).base, 1);
        cache.lookup(range(2).base, 1);
        let evicted = cache.insert(range(3), MrHandle(3)).unwrap();
        assert_eq!(evicted.handle, MrHandle(1));
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.lookup(range(1).base, 1), None);
        assert_eq!(cache.lookup(range(3).base, 1), Some(MrHandle(3)));
    }

    #[test]
    fn clear_returns_all_entries() {
        let mut cache = MrCache::new(8);
        for i in 0..5 {
            cache.insert(range(i), MrHandle(i));
        }
        let drained = cache.clear();
        assert_eq!(drained.len(), 5);
        assert!(cache.is_empty());
    }
}
