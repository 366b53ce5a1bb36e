//! Tuning options and the boot routine.
//!
//! [`CacheRuntime::boot`] runs once, after the shared allocator has
//! finalized slab geometry: it freezes the per-class capacity table,
//! derives the GC tick interval, and builds the handle registry. Runtimes
//! are plain values rather than ambient globals so tests can stand up
//! several independent instances; [`crate::tls`] pins one of them
//! process-wide for thread-bound caches.

use std::sync::Arc;

use crate::cache_bin::BinCapacityTable;
use crate::domain::{DomainBackend, DomainId};
use crate::registry::{CacheRegistry, RegistryError};
use crate::thread_cache::ThreadCache;

/// Tuning knobs for the thread-cache layer.
#[derive(Clone, Debug)]
pub struct CacheOptions {
    /// Largest object size caches hold on to. Clamped at boot to at least
    /// the small-class ceiling and at most the largest defined class.
    pub max_cached_size: usize,
    /// Allocation/free events per full GC sweep over a cache's bins.
    pub gc_sweep_interval: u32,
    /// Most registry handle indices that may ever be issued.
    pub max_registry_slots: usize,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_cached_size: 32 * 1024,
            gc_sweep_interval: 8192,
            max_registry_slots: 4096,
        }
    }
}

/// Booted, immutable state shared by every cache in one allocator instance.
pub struct CacheRuntime {
    options: CacheOptions,
    layout: BinCapacityTable,
    registry: CacheRegistry,
    backend: Arc<dyn DomainBackend>,
    /// Events between GC ticks; one full sweep visits every bin.
    gc_interval: u32,
}

impl CacheRuntime {
    /// Freeze the capacity table and registry. Must happen after slab
    /// geometry is final; a geometry change requires a fresh boot.
    pub fn boot(options: CacheOptions, backend: Arc<dyn DomainBackend>) -> Arc<Self> {
        let layout = BinCapacityTable::boot(options.max_cached_size);
        let gc_interval = (options.gc_sweep_interval / layout.nclasses() as u32).max(1);
        let registry = CacheRegistry::new(options.max_registry_slots);
        log::debug!(
            "thread-cache layer booted: {} classes, worst-case footprint {} bytes per cache",
            layout.nclasses() - 1,
            layout.max_footprint(),
        );
        Arc::new(Self { options, layout, registry, backend, gc_interval })
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    pub fn layout(&self) -> &BinCapacityTable {
        &self.layout
    }

    pub fn registry(&self) -> &CacheRegistry {
        &self.registry
    }

    pub fn backend(&self) -> Arc<dyn DomainBackend> {
        Arc::clone(&self.backend)
    }

    /// Build a cache associated with the backend's chosen domain.
    pub fn new_cache(&self) -> ThreadCache {
        self.new_cache_in(self.backend.choose_domain())
    }

    /// Build a cache associated with a specific domain.
    pub fn new_cache_in(&self, domain: DomainId) -> ThreadCache {
        ThreadCache::new(&self.layout, self.gc_interval, self.backend(), domain)
    }

    /// Seat a registry handle over a freshly built cache.
    pub fn create_handle(&self) -> Result<usize, RegistryError> {
        self.registry.create(|| Box::new(self.new_cache()))
    }

    /// Drain the handle's cache; the index stays issued.
    pub fn flush_handle(&self, ind: usize) {
        self.registry.flush(ind);
    }

    /// Drain the handle's cache and recycle the index.
    pub fn destroy_handle(&self, ind: usize) {
        self.registry.destroy(ind);
    }

    /// Fork-safety hooks, forwarded to the registry lock. The process-level
    /// fork orchestration calls these; they are unconditional.
    pub fn prefork(&self) {
        self.registry.prefork();
    }

    pub fn postfork_parent(&self) {
        self.registry.postfork_parent();
    }

    pub fn postfork_child(&self) {
        self.registry.postfork_child();
    }
}
