//! rtcache: the thread-caching front end of a size-classed allocator.
//!
//! Each thread owns a set of [`cache_bin::CacheBin`] pointer stacks, one
//! per size class. Allocation and deallocation hit the bins without
//! taking any lock; misses refill from the owning domain, overflows and
//! periodic GC flush back to it through the [`domain::DomainBackend`]
//! capability surface. A process-wide [`registry::CacheRegistry`] serves
//! callers that want caches decoupled from thread lifetime, and
//! [`tls`] binds one cache per thread over a booted
//! [`config::CacheRuntime`].

pub mod cache_bin;
pub mod config;
pub mod domain;
pub mod registry;
pub mod size_class;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod thread_cache;
pub mod tls;

/// Page size assumed by the size-class tables (8 KiB).
pub const PAGE_SHIFT: usize = 13;
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

pub use cache_bin::{BinCapacityTable, CacheBin};
pub use config::{CacheOptions, CacheRuntime};
pub use domain::{DomainBackend, DomainId};
pub use registry::{CacheRegistry, RegistryError};
pub use thread_cache::ThreadCache;
