//! Thread cache: per-owner free-object pools for lock-free allocation.
//!
//! A cache holds one [`CacheBin`] per size class up to the configured
//! ceiling. The fast paths (bin hit on alloc, bin space on free) touch no
//! shared state. Underflow refills a batch from the associated domain;
//! overflow and periodic GC events drain batches back to the domains that
//! own the objects, which are not necessarily the domain the cache is
//! associated with today.

use std::sync::Arc;

use core::ptr::NonNull;

use crate::cache_bin::{BinCapacityTable, CacheBin, Ticker};
use crate::domain::{BinLock, DomainBackend, DomainId, LargeLock};
use crate::size_class::is_small_class;
#[cfg(feature = "profiling")]
use crate::size_class::class_to_size;

/// Per-thread (or per-handle) cache of free objects.
///
/// Not internally synchronized: at most one logical owner may touch a cache
/// at a time. That owner is the bound thread for TLS caches, or whatever
/// external discipline coordinates a registry handle.
pub struct ThreadCache {
    bins: Box<[CacheBin]>,
    /// Domain this cache is associated with; objects in the bins may be
    /// owned elsewhere.
    domain: DomainId,
    backend: Arc<dyn DomainBackend>,
    /// Next bin a GC event will visit.
    gc_cursor: usize,
    gc_ticker: Ticker,
    #[cfg(feature = "profiling")]
    pending_profile_bytes: usize,
}

// A cache exclusively owns the free objects on its stacks; the raw pointers
// are not aliased anywhere. The single-logical-owner contract makes moving
// a cache between threads sound (registry handles rely on it).
unsafe impl Send for ThreadCache {}

impl ThreadCache {
    /// Build a cache sized by `layout` and associate it with `domain`.
    pub fn new(
        layout: &BinCapacityTable,
        gc_interval: u32,
        backend: Arc<dyn DomainBackend>,
        domain: DomainId,
    ) -> Self {
        let bins: Box<[CacheBin]> = (0..layout.nclasses())
            .map(|cls| CacheBin::new(layout.ncached_max(cls)))
            .collect();
        let mut cache = Self {
            bins,
            domain,
            backend,
            gc_cursor: 0,
            gc_ticker: Ticker::new(gc_interval.max(1)),
            #[cfg(feature = "profiling")]
            pending_profile_bytes: 0,
        };
        cache.associate(domain);
        cache
    }

    /// Domain the cache is currently associated with.
    #[inline]
    pub fn domain(&self) -> DomainId {
        self.domain
    }

    /// Number of classes this cache has bins for (including the class 0
    /// sentinel). Classes at or above this go uncached.
    #[inline]
    pub fn nclasses(&self) -> usize {
        self.bins.len()
    }

    /// Objects currently cached for `class`.
    #[inline]
    pub fn ncached(&self, class: usize) -> usize {
        self.bins[class].ncached()
    }

    /// Allocate an object of `class` from the cache, refilling from the
    /// associated domain on underflow. `None` means the domain could not
    /// supply objects either; the caller falls back to uncached allocation.
    #[inline]
    pub fn alloc(&mut self, class: usize) -> Option<NonNull<u8>> {
        debug_assert!(class != 0 && class < self.bins.len());
        self.event();
        let bin = &mut self.bins[class];
        match bin.pop() {
            Some(obj) => {
                cfg_if::cfg_if! {
                    if #[cfg(feature = "stats")] {
                        bin.nrequests += 1;
                    }
                }
                #[cfg(feature = "profiling")]
                {
                    self.pending_profile_bytes += class_to_size(class);
                }
                Some(obj)
            }
            None => self.alloc_hard(class),
        }
    }

    /// Underflow path: merge pending profile bytes, then batch-refill small
    /// classes from the associated domain. Large classes are not refilled
    /// through the cache.
    #[cold]
    fn alloc_hard(&mut self, class: usize) -> Option<NonNull<u8>> {
        if !is_small_class(class) {
            return None;
        }
        let backend = Arc::clone(&self.backend);
        let domain = self.domain;
        #[cfg(feature = "profiling")]
        {
            let bytes = core::mem::take(&mut self.pending_profile_bytes);
            if bytes > 0 && backend.profile_accum(domain, bytes) {
                backend.profile_dump();
            }
        }
        let bin = &mut self.bins[class];
        backend.refill_small(domain, class, bin.fill_count(), bin);
        let obj = bin.pop()?;
        cfg_if::cfg_if! {
            if #[cfg(feature = "stats")] {
                bin.nrequests += 1;
            }
        }
        #[cfg(feature = "profiling")]
        {
            self.pending_profile_bytes += class_to_size(class);
        }
        Some(obj)
    }

    /// Return a freed object of `class` to the cache, draining half the bin
    /// first when it is full.
    #[inline]
    pub fn dealloc(&mut self, obj: NonNull<u8>, class: usize) {
        debug_assert!(class != 0 && class < self.bins.len());
        self.event();
        if self.bins[class].is_full() {
            let rem = self.bins[class].ncached_max() >> 1;
            if is_small_class(class) {
                self.flush_small(class, rem);
            } else {
                self.flush_large(class, rem);
            }
        }
        let pushed = self.bins[class].push(obj);
        debug_assert!(pushed.is_ok());
        let _ = pushed;
    }

    /// Return all but the most recently freed `rem` objects of a small
    /// class to their owning domains.
    ///
    /// The batch is partitioned by owner: each pass locks the owning domain
    /// of the first unflushed object, drains every object that domain owns,
    /// and defers the rest to the next pass, so each pass retires at least
    /// one domain and lock hold time is bounded by that domain's share.
    /// Request stats merge exactly once, on the pass that locks the cache's
    /// own domain, or in a final pass if no flushed object belonged to it.
    pub fn flush_small(&mut self, class: usize, rem: usize) {
        debug_assert!(is_small_class(class));
        let backend = Arc::clone(&self.backend);
        let own = self.domain;
        let bin = &mut self.bins[class];
        debug_assert!(rem <= bin.ncached());
        let nflush = bin.ncached().saturating_sub(rem);

        // Resolve each object's owner once up front; ownership may change
        // between flushes but not during one.
        let mut batch: Vec<(NonNull<u8>, DomainId)> = bin.stack[..nflush]
            .iter()
            .map(|&obj| (obj, backend.owning_domain(obj)))
            .collect();

        let mut merged_stats = false;
        while !batch.is_empty() {
            let locked = batch[0].1;
            let guard = BinLock::acquire(&*backend, locked, class);
            if cfg!(feature = "stats") && locked == own && !merged_stats {
                merged_stats = true;
                backend.merge_bin_stats(own, class, bin.take_requests());
            }
            let before = batch.len();
            let mut ndeferred = 0;
            for i in 0..before {
                let (obj, owner) = batch[i];
                if owner == locked {
                    // Safety: obj came off this cache's stack and is being
                    // handed back to its owner under the bin lock.
                    unsafe { backend.deallocate_small(locked, class, obj) };
                } else {
                    batch[ndeferred] = (obj, owner);
                    ndeferred += 1;
                }
            }
            drop(guard);
            backend.notify_decay(locked, before - ndeferred);
            batch.truncate(ndeferred);
        }
        if cfg!(feature = "stats") && !merged_stats {
            // No flushed object belonged to the associated domain.
            let _guard = BinLock::acquire(&*backend, own, class);
            backend.merge_bin_stats(own, class, bin.take_requests());
        }
        bin.complete_flush(nflush);
    }

    /// Large-class counterpart of [`flush_small`]: same contract and
    /// termination argument, but locking is per domain rather than per
    /// class bin, and pending profile bytes flush once on the own-domain
    /// pass.
    ///
    /// [`flush_small`]: ThreadCache::flush_small
    pub fn flush_large(&mut self, class: usize, rem: usize) {
        debug_assert!(!is_small_class(class) && class != 0);
        let backend = Arc::clone(&self.backend);
        let own = self.domain;
        debug_assert!(rem <= self.bins[class].ncached());
        let nflush = self.bins[class].ncached().saturating_sub(rem);

        let mut batch: Vec<(NonNull<u8>, DomainId)> = self.bins[class].stack[..nflush]
            .iter()
            .map(|&obj| (obj, backend.owning_domain(obj)))
            .collect();

        let mut merged_stats = false;
        while !batch.is_empty() {
            let locked = batch[0].1;
            let mut dump = false;
            let guard = LargeLock::acquire(&*backend, locked);
            let before = batch.len();
            let mut ndeferred = 0;
            for i in 0..before {
                let (obj, owner) = batch[i];
                if owner == locked {
                    // Safety: obj came off this cache's stack and is being
                    // handed back to its owner under the large lock.
                    unsafe { backend.deallocate_large(locked, obj) };
                } else {
                    batch[ndeferred] = (obj, owner);
                    ndeferred += 1;
                }
            }
            if locked == own {
                dump = self.take_profile_accum(&*backend);
                if cfg!(feature = "stats") && !merged_stats {
                    merged_stats = true;
                    backend.merge_large_stats(own, class, self.bins[class].take_requests());
                }
            }
            drop(guard);
            if dump {
                backend.profile_dump();
            }
            backend.notify_decay(locked, before - ndeferred);
            batch.truncate(ndeferred);
        }
        if cfg!(feature = "stats") && !merged_stats {
            backend.merge_large_stats(own, class, self.bins[class].take_requests());
        }
        self.bins[class].complete_flush(nflush);
    }

    /// Take the pending profile accumulator and fold it into the associated
    /// domain. Returns true when the merge crossed the dump threshold.
    #[inline]
    fn take_profile_accum(&mut self, backend: &dyn DomainBackend) -> bool {
        #[cfg(feature = "profiling")]
        {
            let bytes = core::mem::take(&mut self.pending_profile_bytes);
            if bytes > 0 {
                return backend.profile_accum(self.domain, bytes);
            }
        }
        let _ = backend;
        false
    }

    #[inline]
    fn event(&mut self) {
        if self.gc_ticker.tick() {
            self.event_hard();
        }
    }

    /// One GC event: size a partial flush of the cursor bin from its
    /// low-water mark and adapt its refill rate, then advance the cursor.
    ///
    /// A bin that kept a floor of objects cached all interval is shedding
    /// more than it reuses, so 3/4 of that floor is flushed and the refill
    /// batch halves. A bin that ran dry doubles its refill batch. The
    /// divisor stays in range so the batch never drops below one object.
    pub(crate) fn event_hard(&mut self) {
        let class = self.gc_cursor;
        let bin = &self.bins[class];
        let low_water = bin.low_water;
        if low_water > 0 {
            let rem = bin.ncached() - low_water as usize + ((low_water as usize) >> 2);
            if is_small_class(class) {
                self.flush_small(class, rem);
            } else if class != 0 {
                self.flush_large(class, rem);
            }
            let bin = &mut self.bins[class];
            if (bin.ncached_max >> (bin.lg_fill_div + 1)) >= 1 {
                bin.lg_fill_div += 1;
            }
        } else if low_water < 0 {
            let bin = &mut self.bins[class];
            if bin.lg_fill_div > 1 {
                bin.lg_fill_div -= 1;
            }
        }
        self.bins[class].reset_low_water();
        self.gc_cursor += 1;
        if self.gc_cursor == self.bins.len() {
            self.gc_cursor = 0;
        }
    }

    fn associate(&mut self, domain: DomainId) {
        self.domain = domain;
        if cfg!(feature = "stats") {
            self.backend.link_cache(domain);
        }
    }

    fn dissociate(&mut self) {
        if cfg!(feature = "stats") {
            self.backend.unlink_cache(self.domain);
            self.stats_merge();
        }
    }

    /// Move the cache to a different domain without disturbing its cached
    /// objects; they keep their original owners and flush correctly later.
    pub fn reassociate(&mut self, domain: DomainId) {
        self.dissociate();
        self.associate(domain);
    }

    /// Merge and reset every bin's request counter into the associated
    /// domain's stats.
    pub fn stats_merge(&mut self) {
        let backend = Arc::clone(&self.backend);
        let own = self.domain;
        for class in 1..self.bins.len() {
            let nrequests = self.bins[class].take_requests();
            if is_small_class(class) {
                let _guard = BinLock::acquire(&*backend, own, class);
                backend.merge_bin_stats(own, class, nrequests);
            } else {
                backend.merge_large_stats(own, class, nrequests);
            }
        }
    }

    /// Flush every bin and dissociate. Equivalent to dropping the cache.
    pub fn destroy(self) {}

    fn teardown(&mut self) {
        for class in 1..self.bins.len() {
            if is_small_class(class) {
                self.flush_small(class, 0);
            } else {
                self.flush_large(class, 0);
            }
            debug_assert_eq!(self.bins[class].nrequests, 0);
        }
        self.dissociate();
        #[cfg(feature = "profiling")]
        {
            let bytes = core::mem::take(&mut self.pending_profile_bytes);
            if bytes > 0 && self.backend.profile_accum(self.domain, bytes) {
                self.backend.profile_dump();
            }
        }
        log::trace!("thread cache dissociated from domain {:?}", self.domain);
    }
}

impl Drop for ThreadCache {
    fn drop(&mut self) {
        self.teardown();
    }
}
