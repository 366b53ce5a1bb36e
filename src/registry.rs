//! Process-wide registry of explicitly managed caches.
//!
//! A registry handle is a stable integer index into a slot table, for
//! callers that want a cache decoupled from any thread's lifetime.
//! Destroyed indices are recycled LIFO through an intra-table free list;
//! the table itself only grows. One lock guards slot state and nothing
//! else: caches are always constructed and drained outside it, and it is
//! never held together with any domain lock.

use spin::Mutex;
use thiserror::Error;

use crate::thread_cache::ThreadCache;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Every index up to the configured maximum is issued and none is free.
    #[error("cache registry slot indices exhausted")]
    Exhausted,
}

const NO_SLOT: u32 = u32::MAX;

/// A slot is live (seated cache), detached (flushed, index still issued),
/// or free (on the free list awaiting reuse).
struct Slot {
    cache: Option<Box<ThreadCache>>,
    /// Next free slot while this one is on the free list.
    next_free: u32,
    free: bool,
}

struct SlotTable {
    slots: Vec<Slot>,
    free_head: u32,
}

/// Slot table for caches addressed by index rather than by thread.
pub struct CacheRegistry {
    table: Mutex<SlotTable>,
    max_slots: usize,
}

impl CacheRegistry {
    pub fn new(max_slots: usize) -> Self {
        Self {
            table: Mutex::new(SlotTable { slots: Vec::new(), free_head: NO_SLOT }),
            max_slots,
        }
    }

    /// Number of slot indices ever issued, live or not.
    pub fn nslots(&self) -> usize {
        self.table.lock().slots.len()
    }

    /// Seat a new cache and return its index, preferring a recycled slot
    /// over a never-issued one.
    ///
    /// `make` runs outside the registry lock, after a capacity precheck so
    /// a cache is not built only to be thrown away (a concurrent `create`
    /// can still win the last slot, in which case the loser's cache drains
    /// and is discarded, also outside the lock).
    pub fn create(
        &self,
        make: impl FnOnce() -> Box<ThreadCache>,
    ) -> Result<usize, RegistryError> {
        {
            let t = self.table.lock();
            if t.free_head == NO_SLOT && t.slots.len() >= self.max_slots {
                return Err(RegistryError::Exhausted);
            }
        }

        let cache = make();

        let mut t = self.table.lock();
        let ind = if t.free_head != NO_SLOT {
            let ind = t.free_head as usize;
            let next = t.slots[ind].next_free;
            t.free_head = next;
            t.slots[ind] = Slot { cache: Some(cache), next_free: NO_SLOT, free: false };
            ind
        } else {
            if t.slots.len() >= self.max_slots {
                drop(t);
                return Err(RegistryError::Exhausted);
            }
            t.slots.push(Slot { cache: Some(cache), next_free: NO_SLOT, free: false });
            t.slots.len() - 1
        };
        drop(t);
        log::debug!("cache handle {ind} created");
        Ok(ind)
    }

    /// Drain and destroy the cache at `ind`. The slot stays issued (not
    /// reusable) until `destroy`; a later `flush` of the same index is a
    /// no-op. The drain runs outside the registry lock.
    pub fn flush(&self, ind: usize) {
        let cache = {
            let mut t = self.table.lock();
            t.slots.get_mut(ind).and_then(|slot| slot.cache.take())
        };
        drop(cache);
    }

    /// Drain and destroy the cache at `ind` and recycle the index. The
    /// drain runs outside the registry lock.
    pub fn destroy(&self, ind: usize) {
        let cache = {
            let mut t = self.table.lock();
            let free_head = t.free_head;
            let Some(slot) = t.slots.get_mut(ind) else {
                debug_assert!(false, "destroy of never-issued index {ind}");
                return;
            };
            if slot.free {
                debug_assert!(false, "double destroy of index {ind}");
                return;
            }
            let cache = slot.cache.take();
            slot.free = true;
            slot.next_free = free_head;
            t.free_head = ind as u32;
            cache
        };
        drop(cache);
        log::debug!("cache handle {ind} destroyed");
    }

    /// Pointer to the cache seated at `ind`, if any.
    ///
    /// The registry lock is released before returning; dereferencing is
    /// only sound under the same external discipline that covers all cache
    /// mutation, plus the guarantee that no one flushes or destroys `ind`
    /// while the pointer is in use.
    pub fn cache_ptr(&self, ind: usize) -> Option<core::ptr::NonNull<ThreadCache>> {
        let t = self.table.lock();
        t.slots.get(ind).and_then(|s| s.cache.as_deref().map(core::ptr::NonNull::from))
    }

    /// Acquire the registry lock ahead of `fork` and keep it held across
    /// the boundary, so the child never inherits a lock owned by a thread
    /// that does not exist on its side.
    pub fn prefork(&self) {
        core::mem::forget(self.table.lock());
    }

    /// Release the lock taken by `prefork`, in the parent.
    pub fn postfork_parent(&self) {
        debug_assert!(self.table.is_locked());
        unsafe { self.table.force_unlock() };
    }

    /// Release (reset) the lock taken by `prefork`, in the child.
    pub fn postfork_child(&self) {
        debug_assert!(self.table.is_locked());
        unsafe { self.table.force_unlock() };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::cache_bin::BinCapacityTable;
    use crate::domain::{DomainBackend, DomainId};
    use crate::testing::StubDomain;

    fn env() -> (Arc<StubDomain>, BinCapacityTable) {
        (Arc::new(StubDomain::new(1)), BinCapacityTable::boot(32768))
    }

    fn make(stub: &Arc<StubDomain>, layout: &BinCapacityTable) -> Box<ThreadCache> {
        let backend: Arc<dyn DomainBackend> = stub.clone();
        Box::new(ThreadCache::new(layout, u32::MAX, backend, DomainId(0)))
    }

    #[test]
    fn indices_issue_in_order() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(8);
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(0));
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(1));
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(2));
        assert_eq!(reg.nslots(), 3);
    }

    #[test]
    fn destroyed_index_reused_lifo() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(8);
        let a = reg.create(|| make(&stub, &layout)).unwrap();
        let b = reg.create(|| make(&stub, &layout)).unwrap();

        reg.destroy(a);
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(a));

        reg.destroy(b);
        reg.destroy(a);
        // Last freed comes back first.
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(a));
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(b));
        // The table never shrank.
        assert_eq!(reg.nslots(), 2);
    }

    #[test]
    fn create_fails_when_exhausted() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(2);
        reg.create(|| make(&stub, &layout)).unwrap();
        reg.create(|| make(&stub, &layout)).unwrap();
        assert_eq!(reg.create(|| make(&stub, &layout)), Err(RegistryError::Exhausted));

        // Freeing an index makes create viable again.
        reg.destroy(1);
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(1));
    }

    #[test]
    fn flush_keeps_slot_issued() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(8);
        let ind = reg.create(|| make(&stub, &layout)).unwrap();

        reg.flush(ind);
        assert!(reg.cache_ptr(ind).is_none());
        // Index not recycled: the next create gets a fresh slot.
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(ind + 1));

        // Flushing an already-empty slot is harmless.
        reg.flush(ind);
        reg.destroy(ind);
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(ind));
    }

    #[test]
    fn destroy_drains_cached_objects() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(8);
        let ind = reg.create(|| make(&stub, &layout)).unwrap();

        let mut cache = reg.cache_ptr(ind).unwrap();
        // Single-owner discipline: this test is the only user of the slot.
        let tc = unsafe { cache.as_mut() };
        let obj = tc.alloc(4).unwrap();
        tc.dealloc(obj, 4);
        let outstanding = tc.ncached(4);
        assert!(outstanding > 0);

        reg.destroy(ind);
        assert_eq!(stub.freed_small(DomainId(0), 4).len(), outstanding);
        assert_eq!(stub.outstanding_objects(), 0);
    }

    #[test]
    fn concurrent_creates_get_distinct_indices() {
        let (stub, layout) = env();
        let layout = Arc::new(layout);
        let reg = Arc::new(CacheRegistry::new(64));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = Arc::clone(&reg);
                let stub = Arc::clone(&stub);
                let layout = Arc::clone(&layout);
                std::thread::spawn(move || {
                    (0..4)
                        .map(|_| reg.create(|| make(&stub, &layout)).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 32, "duplicate index issued");
    }

    #[test]
    fn fork_hooks_bracket_the_lock() {
        let (stub, layout) = env();
        let reg = CacheRegistry::new(8);

        reg.prefork();
        reg.postfork_parent();
        // Registry still works after a simulated fork round trip.
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(0));

        reg.prefork();
        reg.postfork_child();
        assert_eq!(reg.create(|| make(&stub, &layout)), Ok(1));
    }
}
