//! Test-support implementation of the shared-domain capability surface.
//!
//! [`StubDomain`] models a process with several allocator domains: objects
//! are real heap allocations tagged with an owning domain, bin and large
//! locks are real mutexes, and every deallocation, stats merge, refill and
//! decay notification is recorded so tests can assert on exactly what
//! crossed the boundary.

use std::alloc::{Layout, alloc, dealloc, handle_alloc_error};
use std::collections::HashMap;
use std::ptr::NonNull;

use spin::Mutex;

use crate::cache_bin::CacheBin;
use crate::domain::{DomainBackend, DomainId};
use crate::size_class::{NUM_SIZE_CLASSES, class_to_size};

#[derive(Default)]
struct BinShard {
    /// Addresses returned to this bin, oldest first.
    freed: Vec<usize>,
    nrequests: u64,
    /// Stats merges that carried a nonzero request delta.
    nonzero_merges: u64,
}

#[derive(Default)]
struct LargeShard {
    freed: Vec<usize>,
    nrequests: HashMap<usize, u64>,
    nonzero_merges: u64,
}

#[derive(Default)]
struct ProfileState {
    accum: usize,
    threshold: usize,
    dumps: usize,
}

/// An in-memory multi-domain allocator backend for tests.
pub struct StubDomain {
    ndomains: usize,
    /// Lock objects; the shard data sits in its own mutex so a holder of
    /// the bin lock can still reach it.
    bin_locks: Vec<Vec<Mutex<()>>>,
    large_locks: Vec<Mutex<()>>,
    bins: Vec<Vec<Mutex<BinShard>>>,
    large: Vec<Mutex<LargeShard>>,
    /// Object address to (owner, class); entries leave on deallocation.
    owners: Mutex<HashMap<usize, (DomainId, usize)>>,
    decay: Mutex<HashMap<u32, usize>>,
    linked: Mutex<Vec<u32>>,
    refill_calls: Mutex<u64>,
    profile: Mutex<ProfileState>,
}

impl StubDomain {
    pub fn new(ndomains: usize) -> Self {
        assert!(ndomains >= 1);
        Self {
            ndomains,
            bin_locks: (0..ndomains)
                .map(|_| (0..NUM_SIZE_CLASSES).map(|_| Mutex::new(())).collect())
                .collect(),
            large_locks: (0..ndomains).map(|_| Mutex::new(())).collect(),
            bins: (0..ndomains)
                .map(|_| (0..NUM_SIZE_CLASSES).map(|_| Mutex::new(BinShard::default())).collect())
                .collect(),
            large: (0..ndomains).map(|_| Mutex::new(LargeShard::default())).collect(),
            owners: Mutex::new(HashMap::new()),
            decay: Mutex::new(HashMap::new()),
            linked: Mutex::new(Vec::new()),
            refill_calls: Mutex::new(0),
            profile: Mutex::new(ProfileState { threshold: usize::MAX, ..Default::default() }),
        }
    }

    /// Lower the profile dump threshold from its default of "never".
    pub fn set_profile_threshold(&self, threshold: usize) {
        self.profile.lock().threshold = threshold;
    }

    fn layout_for(class: usize) -> Layout {
        Layout::from_size_align(class_to_size(class).max(8), 8).expect("class layout")
    }

    /// Allocate one object of `class` owned by `domain`.
    pub fn alloc_obj(&self, domain: DomainId, class: usize) -> NonNull<u8> {
        assert!((domain.0 as usize) < self.ndomains);
        let layout = Self::layout_for(class);
        let ptr = unsafe { alloc(layout) };
        let Some(obj) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        self.owners.lock().insert(obj.as_ptr() as usize, (domain, class));
        obj
    }

    /// Reassign ownership of a live object, as domain rebalancing would.
    pub fn migrate_obj(&self, obj: NonNull<u8>, to: DomainId) {
        let mut owners = self.owners.lock();
        let entry = owners.get_mut(&(obj.as_ptr() as usize)).expect("unknown object");
        entry.0 = to;
    }

    /// Addresses of `class` objects returned to `domain`, oldest first.
    pub fn freed_small(&self, domain: DomainId, class: usize) -> Vec<usize> {
        self.bins[domain.0 as usize][class].lock().freed.clone()
    }

    /// Addresses of large objects returned to `domain`, oldest first.
    pub fn freed_large(&self, domain: DomainId) -> Vec<usize> {
        self.large[domain.0 as usize].lock().freed.clone()
    }

    pub fn nrequests_small(&self, domain: DomainId, class: usize) -> u64 {
        self.bins[domain.0 as usize][class].lock().nrequests
    }

    pub fn nrequests_large(&self, domain: DomainId, class: usize) -> u64 {
        self.large[domain.0 as usize].lock().nrequests.get(&class).copied().unwrap_or(0)
    }

    pub fn nonzero_bin_merges(&self, domain: DomainId, class: usize) -> u64 {
        self.bins[domain.0 as usize][class].lock().nonzero_merges
    }

    pub fn nonzero_large_merges(&self, domain: DomainId) -> u64 {
        self.large[domain.0 as usize].lock().nonzero_merges
    }

    /// Total objects `domain` has been told were flushed back to it.
    pub fn decay_count(&self, domain: DomainId) -> usize {
        self.decay.lock().get(&domain.0).copied().unwrap_or(0)
    }

    /// Domains with a live cache association, ascending.
    pub fn linked_domains(&self) -> Vec<u32> {
        let mut v = self.linked.lock().clone();
        v.sort_unstable();
        v
    }

    pub fn refill_calls(&self) -> u64 {
        *self.refill_calls.lock()
    }

    pub fn profile_dumps(&self) -> usize {
        self.profile.lock().dumps
    }

    /// Objects allocated through the stub and not yet returned.
    pub fn outstanding_objects(&self) -> usize {
        self.owners.lock().len()
    }
}

impl DomainBackend for StubDomain {
    fn choose_domain(&self) -> DomainId {
        DomainId(0)
    }

    fn owning_domain(&self, obj: NonNull<u8>) -> DomainId {
        self.owners.lock().get(&(obj.as_ptr() as usize)).expect("unknown object").0
    }

    fn lock_bin(&self, domain: DomainId, class: usize) {
        core::mem::forget(self.bin_locks[domain.0 as usize][class].lock());
    }

    fn unlock_bin(&self, domain: DomainId, class: usize) {
        let lock = &self.bin_locks[domain.0 as usize][class];
        debug_assert!(lock.is_locked());
        unsafe { lock.force_unlock() };
    }

    fn lock_large(&self, domain: DomainId) {
        core::mem::forget(self.large_locks[domain.0 as usize].lock());
    }

    fn unlock_large(&self, domain: DomainId) {
        let lock = &self.large_locks[domain.0 as usize];
        debug_assert!(lock.is_locked());
        unsafe { lock.force_unlock() };
    }

    unsafe fn deallocate_small(&self, domain: DomainId, class: usize, obj: NonNull<u8>) {
        debug_assert!(self.bin_locks[domain.0 as usize][class].is_locked());
        let addr = obj.as_ptr() as usize;
        let owner = self.owners.lock().remove(&addr).expect("unknown object");
        assert_eq!(owner, (domain, class), "object returned to the wrong bin");
        self.bins[domain.0 as usize][class].lock().freed.push(addr);
        unsafe { dealloc(obj.as_ptr(), Self::layout_for(class)) };
    }

    unsafe fn deallocate_large(&self, domain: DomainId, obj: NonNull<u8>) {
        debug_assert!(self.large_locks[domain.0 as usize].is_locked());
        let addr = obj.as_ptr() as usize;
        let (owner, class) = self.owners.lock().remove(&addr).expect("unknown object");
        assert_eq!(owner, domain, "object returned to the wrong domain");
        self.large[domain.0 as usize].lock().freed.push(addr);
        unsafe { dealloc(obj.as_ptr(), Self::layout_for(class)) };
    }

    fn merge_bin_stats(&self, domain: DomainId, class: usize, nrequests: u64) {
        debug_assert!(self.bin_locks[domain.0 as usize][class].is_locked());
        let mut shard = self.bins[domain.0 as usize][class].lock();
        shard.nrequests += nrequests;
        if nrequests > 0 {
            shard.nonzero_merges += 1;
        }
    }

    fn merge_large_stats(&self, domain: DomainId, class: usize, nrequests: u64) {
        let mut shard = self.large[domain.0 as usize].lock();
        *shard.nrequests.entry(class).or_insert(0) += nrequests;
        if nrequests > 0 {
            shard.nonzero_merges += 1;
        }
    }

    fn notify_decay(&self, domain: DomainId, nflushed: usize) {
        *self.decay.lock().entry(domain.0).or_insert(0) += nflushed;
    }

    fn refill_small(&self, domain: DomainId, class: usize, nfill: usize, bin: &mut CacheBin) {
        *self.refill_calls.lock() += 1;
        for _ in 0..nfill {
            if bin.push(self.alloc_obj(domain, class)).is_err() {
                break;
            }
        }
    }

    fn link_cache(&self, domain: DomainId) {
        self.linked.lock().push(domain.0);
    }

    fn unlink_cache(&self, domain: DomainId) {
        let mut linked = self.linked.lock();
        if let Some(pos) = linked.iter().position(|&d| d == domain.0) {
            linked.swap_remove(pos);
        }
    }

    fn profile_accum(&self, _domain: DomainId, bytes: usize) -> bool {
        let mut p = self.profile.lock();
        p.accum += bytes;
        if p.accum >= p.threshold {
            p.accum = 0;
            true
        } else {
            false
        }
    }

    fn profile_dump(&self) {
        self.profile.lock().dumps += 1;
    }
}
