//! Capability surface of the shared allocator domain.
//!
//! The thread cache never owns slabs or large-object metadata; it borrows
//! them through [`DomainBackend`]. A process typically has several domains
//! (independent lock-protected allocator instances) behind one backend, and
//! a cached object's owning domain may differ from the domain its cache is
//! currently associated with: objects migrate with the threads that free
//! them, and the flush path sorts that out.
//!
//! Locking is unconditional and blocking; there is no trylock or timeout at
//! this boundary. Critical sections are bounded by one batch drain.

use core::ptr::NonNull;

use crate::cache_bin::CacheBin;

/// Identifies one shared allocator domain behind a [`DomainBackend`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct DomainId(pub u32);

/// Contract the shared allocator exposes to the thread-cache layer.
///
/// Lock methods pair up (`lock_bin`/`unlock_bin`, `lock_large`/
/// `unlock_large`); the cache always drives them through RAII guards so an
/// unlock can never be skipped. Methods documented as "lock held" are only
/// called between the matching pair.
pub trait DomainBackend: Send + Sync {
    /// Domain a newly created cache should associate with.
    fn choose_domain(&self) -> DomainId;

    /// Owning domain of a previously allocated object. Ownership may have
    /// migrated since the object was cached.
    fn owning_domain(&self, obj: NonNull<u8>) -> DomainId;

    /// Acquire exclusive access to one small class's shared free structures.
    fn lock_bin(&self, domain: DomainId, class: usize);
    fn unlock_bin(&self, domain: DomainId, class: usize);

    /// Acquire exclusive access to one domain's large-object metadata.
    fn lock_large(&self, domain: DomainId);
    fn unlock_large(&self, domain: DomainId);

    /// Return a small object to its owning domain.
    ///
    /// # Safety
    /// `obj` must be a live object of `class` owned by `domain`, no longer
    /// reachable from any cache, and the bin lock for (`domain`, `class`)
    /// must be held.
    unsafe fn deallocate_small(&self, domain: DomainId, class: usize, obj: NonNull<u8>);

    /// Return a large object to its owning domain.
    ///
    /// # Safety
    /// `obj` must be a live large object owned by `domain`, no longer
    /// reachable from any cache, and the large lock for `domain` must be
    /// held.
    unsafe fn deallocate_large(&self, domain: DomainId, obj: NonNull<u8>);

    /// Fold a cache's request counter into the domain's small-bin stats.
    /// Bin lock for (`domain`, `class`) held.
    fn merge_bin_stats(&self, domain: DomainId, class: usize, nrequests: u64);

    /// Fold a cache's request counter into the domain's large stats.
    /// Internally synchronized; callable with or without the large lock.
    fn merge_large_stats(&self, domain: DomainId, class: usize, nrequests: u64);

    /// Hint for the domain's decay/trim policy: `nflushed` objects were just
    /// returned to `domain`.
    fn notify_decay(&self, domain: DomainId, nflushed: usize);

    /// Bulk-allocate up to `nfill` objects of `class` from `domain` into
    /// `bin` (via [`CacheBin::push`]). May fill fewer than requested, or
    /// none under memory pressure.
    fn refill_small(&self, domain: DomainId, class: usize, nfill: usize, bin: &mut CacheBin);

    /// A cache associated with `domain` (stats builds link live caches for
    /// enumeration in stats dumps).
    fn link_cache(&self, domain: DomainId) {
        let _ = domain;
    }

    /// A cache dissociated from `domain`.
    fn unlink_cache(&self, domain: DomainId) {
        let _ = domain;
    }

    /// Fold sampled allocation bytes into domain-wide profiling state.
    /// Returns true when the accumulated total crossed the dump threshold.
    fn profile_accum(&self, domain: DomainId, bytes: usize) -> bool {
        let _ = (domain, bytes);
        false
    }

    /// Emit a profile dump. Never called with any domain lock held.
    fn profile_dump(&self) {}
}

/// Holds one small class's bin lock for the guard's lifetime.
pub(crate) struct BinLock<'a> {
    backend: &'a dyn DomainBackend,
    domain: DomainId,
    class: usize,
}

impl<'a> BinLock<'a> {
    pub(crate) fn acquire(backend: &'a dyn DomainBackend, domain: DomainId, class: usize) -> Self {
        backend.lock_bin(domain, class);
        Self { backend, domain, class }
    }
}

impl Drop for BinLock<'_> {
    fn drop(&mut self) {
        self.backend.unlock_bin(self.domain, self.class);
    }
}

/// Holds one domain's large-object lock for the guard's lifetime.
pub(crate) struct LargeLock<'a> {
    backend: &'a dyn DomainBackend,
    domain: DomainId,
}

impl<'a> LargeLock<'a> {
    pub(crate) fn acquire(backend: &'a dyn DomainBackend, domain: DomainId) -> Self {
        backend.lock_large(domain);
        Self { backend, domain }
    }
}

impl Drop for LargeLock<'_> {
    fn drop(&mut self) {
        self.backend.unlock_large(self.domain);
    }
}
