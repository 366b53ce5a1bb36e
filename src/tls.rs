//! Thread-bound caches: lazy install on first use, flush on thread exit.
//!
//! One process-wide [`CacheRuntime`] backs every thread's cache. The cache
//! is created the first time a thread allocates through [`with`], and its
//! drop (explicit via [`destroy_for_current_thread`] or implicit at thread
//! exit through the `thread_local!` destructor) drains every bin back to
//! the shared domains.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::config::CacheRuntime;
use crate::thread_cache::ThreadCache;

static RUNTIME: OnceLock<Arc<CacheRuntime>> = OnceLock::new();

#[derive(Debug, Error)]
pub enum BootError {
    /// A runtime is already pinned for this process.
    #[error("thread-cache runtime already installed")]
    AlreadyInstalled,
}

/// Pin the runtime that backs per-thread caches. Must happen once, before
/// any thread allocates through [`with`].
pub fn install(runtime: Arc<CacheRuntime>) -> Result<(), BootError> {
    RUNTIME.set(runtime).map_err(|_| BootError::AlreadyInstalled)
}

/// The installed runtime, if any.
pub fn installed() -> Option<&'static Arc<CacheRuntime>> {
    RUNTIME.get()
}

thread_local! {
    static CACHE: RefCell<Option<ThreadCache>> = const { RefCell::new(None) };
}

/// Run `f` with the calling thread's cache, creating it on first use.
/// Returns `None` when no runtime is installed; callers fall back to
/// uncached allocation.
pub fn with<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
    let runtime = RUNTIME.get()?;
    CACHE.with(|cell| {
        let mut slot = cell.borrow_mut();
        let cache = slot.get_or_insert_with(|| {
            log::trace!("installing thread cache for {:?}", std::thread::current().id());
            runtime.new_cache()
        });
        Some(f(cache))
    })
}

/// Drain and drop the calling thread's cache, if one exists. A later
/// [`with`] creates a fresh one. Runs implicitly at thread exit.
pub fn destroy_for_current_thread() {
    CACHE.with(|cell| {
        // Take first so the drain runs without the RefCell borrow held.
        let cache = cell.borrow_mut().take();
        drop(cache);
    });
}
