//! End-to-end exercises of the `kmem_*` facade over one shared global pool.
//!
//! The facade is process-global, so every test funnels through the same
//! pool, initialized once. Caches created by different tests are
//! independent; the pool is sized so they never starve each other.

use std::sync::Once;
use std::thread;
use std::time::Duration;

use kpool::mm::kmem::CacheHeader;
use kpool::{
    kfree, kmalloc, kmem_cache_alloc, kmem_cache_create, kmem_cache_destroy, kmem_cache_error,
    kmem_cache_free, kmem_cache_info, kmem_cache_shrink, kmem_init, kzalloc, CacheError,
};

const BLOCK_SIZE: usize = 4096;
const POOL_BLOCKS: usize = 2048;

static INIT: Once = Once::new();

fn init_pool() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();

        let buf: &'static mut [u8] = vec![0u8; (POOL_BLOCKS + 1) * BLOCK_SIZE].leak();
        let base = (buf.as_mut_ptr() as usize + BLOCK_SIZE - 1) & !(BLOCK_SIZE - 1);
        unsafe {
            kmem_init(base as *mut u8, POOL_BLOCKS).unwrap();
        }
    });
}

#[test]
fn buffers_roundtrip() {
    init_pool();

    let small = kmalloc(6);
    assert!(!small.is_null());
    unsafe {
        small.write_bytes(0xAB, 6);
        kfree(small);
    }

    let zeroed = kzalloc(100);
    assert!(!zeroed.is_null());
    unsafe {
        for i in 0..100 {
            assert_eq!(*zeroed.add(i), 0);
        }
        kfree(zeroed);
    }

    assert!(kmalloc(0).is_null());
    assert!(kmalloc((1 << 16) + 1).is_null());

    // A second small buffer reuses the slab the first one came from.
    let again = kmalloc(6);
    assert_eq!(again, small);
    unsafe { kfree(again) };
}

#[test]
fn cache_lifecycle() {
    init_pool();

    let cache = kmem_cache_create("lifecycle", 20, None, None);
    assert!(!cache.is_null());

    unsafe {
        let mut objects = Vec::new();
        for _ in 0..10 {
            let object = kmem_cache_alloc(cache);
            assert!(!object.is_null());
            objects.push(object);
        }
        for object in objects {
            kmem_cache_free(cache, object);
        }

        let stats = (*cache).stats();
        assert_eq!(stats.allocated_objects, 0);
        assert_eq!(stats.slab_count, 1);

        kmem_cache_info(cache);
        assert_eq!(kmem_cache_shrink(cache), stats.blocks_in_slab);
        assert_eq!(kmem_cache_error(cache), CacheError::OK);

        kmem_cache_destroy(cache);
    }
}

#[test]
fn destroy_requires_empty_cache() {
    init_pool();

    let cache = kmem_cache_create("stubborn", 40, None, None);
    assert!(!cache.is_null());

    unsafe {
        let object = kmem_cache_alloc(cache);
        assert!(!object.is_null());

        kmem_cache_destroy(cache);
        assert_eq!(
            kmem_cache_error(cache),
            CacheError::DESTROYING_NON_EMPTY_CACHE
        );

        kmem_cache_free(cache, object);
        kmem_cache_destroy(cache);
    }
}

#[test]
fn many_threads_one_cache() {
    init_pool();

    const THREADS: usize = 100;
    const ITERATIONS: usize = 100;

    let cache = kmem_cache_create("shared", core::mem::size_of::<u32>(), None, None);
    assert!(!cache.is_null());
    let cache_addr = cache as usize;

    let mut handles = Vec::new();
    for index in 0..THREADS {
        handles.push(thread::spawn(move || {
            let cache = cache_addr as *mut CacheHeader;
            let sentinel = index as u32;

            let mut objects = Vec::with_capacity(ITERATIONS);
            for i in 0..ITERATIONS {
                let object = unsafe { kmem_cache_alloc(cache) };
                assert!(!object.is_null());
                unsafe { object.cast::<u32>().write(sentinel) };
                objects.push(object);

                if i % 25 == 0 {
                    thread::sleep(Duration::from_millis(1));
                } else {
                    thread::yield_now();
                }
            }

            for object in objects {
                // Nobody else wrote into this thread's objects.
                assert_eq!(unsafe { object.cast::<u32>().read() }, sentinel);
                unsafe { kmem_cache_free(cache, object) };
                thread::yield_now();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    unsafe {
        assert_eq!((*cache).stats().allocated_objects, 0);
        assert_eq!(kmem_cache_error(cache), CacheError::OK);
        kmem_cache_shrink(cache);
        kmem_cache_destroy(cache);
    }
}
