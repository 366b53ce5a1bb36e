//! End-to-end tests over a booted runtime: registry handles, flush
//! semantics observed from the domain side, and fork hooks.

use std::sync::Arc;

use rtcache::testing::StubDomain;
use rtcache::{CacheOptions, CacheRuntime, DomainBackend, DomainId, RegistryError};

fn boot(ndomains: usize) -> (Arc<StubDomain>, Arc<CacheRuntime>) {
    let stub = Arc::new(StubDomain::new(ndomains));
    let backend: Arc<dyn DomainBackend> = stub.clone();
    let rt = CacheRuntime::boot(CacheOptions::default(), backend);
    (stub, rt)
}

#[test]
fn handle_lifecycle_returns_every_object() {
    let (stub, rt) = boot(1);
    let class = rtcache::size_class::size_to_class(48);

    let ind = rt.create_handle().unwrap();
    let mut cache = rt.registry().cache_ptr(ind).unwrap();
    // This test is the handle's only user.
    let tc = unsafe { cache.as_mut() };

    let objs: Vec<_> = (0..3).map(|_| tc.alloc(class).unwrap()).collect();
    for obj in objs {
        tc.dealloc(obj, class);
    }
    rt.destroy_handle(ind);

    assert_eq!(stub.outstanding_objects(), 0);
    assert_eq!(stub.nrequests_small(DomainId(0), class), 3);
    // The request counter crossed the boundary in exactly one merge.
    assert_eq!(stub.nonzero_bin_merges(DomainId(0), class), 1);
    assert!(stub.linked_domains().is_empty());
}

#[test]
fn flushed_handle_stays_issued() {
    let (stub, rt) = boot(1);
    let ind = rt.create_handle().unwrap();

    rt.flush_handle(ind);
    assert!(rt.registry().cache_ptr(ind).is_none());
    assert_eq!(rt.create_handle().unwrap(), ind + 1);

    rt.destroy_handle(ind);
    assert_eq!(rt.create_handle().unwrap(), ind);
    let _ = stub;
}

#[test]
fn exhausted_registry_reports_error() {
    let stub = Arc::new(StubDomain::new(1));
    let backend: Arc<dyn DomainBackend> = stub.clone();
    let rt = CacheRuntime::boot(
        CacheOptions { max_registry_slots: 1, ..Default::default() },
        backend,
    );

    let ind = rt.create_handle().unwrap();
    assert_eq!(rt.create_handle(), Err(RegistryError::Exhausted));
    rt.destroy_handle(ind);
    assert!(rt.create_handle().is_ok());
}

#[test]
fn caches_from_many_threads_drain_cleanly() {
    let (stub, rt) = boot(2);
    let class = rtcache::size_class::size_to_class(128);

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let rt = Arc::clone(&rt);
            std::thread::spawn(move || {
                let mut tc = rt.new_cache_in(DomainId(i % 2));
                let objs: Vec<_> = (0..64).map(|_| tc.alloc(class).unwrap()).collect();
                for obj in objs {
                    tc.dealloc(obj, class);
                }
                tc.destroy();
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(stub.outstanding_objects(), 0);
    let total = stub.nrequests_small(DomainId(0), class)
        + stub.nrequests_small(DomainId(1), class);
    assert_eq!(total, 8 * 64);
    assert!(stub.linked_domains().is_empty());
}

#[test]
fn fork_hooks_round_trip() {
    let (_stub, rt) = boot(1);

    rt.prefork();
    rt.postfork_parent();
    let ind = rt.create_handle().unwrap();

    rt.prefork();
    rt.postfork_child();
    rt.destroy_handle(ind);
    assert_eq!(rt.create_handle().unwrap(), ind);
}

#[test]
fn migrated_objects_flush_to_their_new_owner() {
    let (stub, rt) = boot(2);
    let class = rtcache::size_class::size_to_class(64);

    let mut tc = rt.new_cache_in(DomainId(0));
    let obj = tc.alloc(class).unwrap();
    // Domain rebalancing hands the underlying slab to domain 1 while the
    // object sits in a cache associated with domain 0.
    stub.migrate_obj(obj, DomainId(1));
    tc.dealloc(obj, class);
    tc.destroy();

    assert!(stub.freed_small(DomainId(1), class).contains(&(obj.as_ptr() as usize)));
    assert_eq!(stub.outstanding_objects(), 0);
}
