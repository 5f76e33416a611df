//! Slab tier: object caches over buddy runs, and the C-style allocation
//! facade.
//!
//! A cache hands out fixed-size objects from its slabs in O(1); slabs are
//! created lazily from buddy memory and returned by an explicit shrink.
//! Twelve built-in buffer caches (size classes `2^5` through `2^16` bytes)
//! back the byte-sized [`kmalloc`]/[`kfree`] pair.
//!
//! ## Facade
//!
//! | API | Description |
//! | --- | ----------- |
//! | `kmem_init(space, n)` | Install the process-global allocator over the caller's pool |
//! | `kmem_cache_create(name, size, ctor, dtor)` | Create a named object cache |
//! | `kmem_cache_alloc(cache)` | Allocate one object |
//! | `kmem_cache_free(cache, obj)` | Free one object |
//! | `kmem_cache_shrink(cache)` | Release empty slabs, returns blocks freed |
//! | `kmem_cache_destroy(cache)` | Destroy an empty cache |
//! | `kmalloc(size)` / `kzalloc(size)` | Allocate a small buffer (zeroed for `kzalloc`) |
//! | `kfree(ptr)` | Free a buffer |
//! | `kmem_cache_info(cache)` | Log the multi-line cache report |
//! | `kmem_cache_error(cache)` | Log and clear the latched error bits |
//!
//! The facade operates on one process-global pool installed by
//! [`kmem_init`]; every function is a thin safe-guarded shim over the
//! header methods, which can equally be called on explicitly owned pools.
//!
//! [`kmem_init`]: self::kmem_init
//! [`kmalloc`]: self::kmalloc
//! [`kfree`]: self::kfree

mod cache;
mod registry;
mod slab;

pub use cache::{CacheHeader, CacheStats};
pub use registry::{CacheHeaderBlock, SlabHeader};
pub use slab::NULL_INDEX;

use core::fmt;
use core::ptr::null_mut;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{AllocError, CacheError};
use crate::mm::AllocatorHeader;


/// L1 cache line size; the stride of the slab color rotation.
pub const CACHE_L1_LINE_SIZE: usize = 64;

/// Maximal cache name length, including the terminator.
pub const MAX_NAME_LENGTH: usize = 256;

/// Smallest buffer size class, as a power-of-two exponent (inclusive).
pub const BUFFER_SIZES_LOWER_BOUND: usize = 5;
/// Largest buffer size class, as a power-of-two exponent (exclusive).
pub const BUFFER_SIZES_UPPER_BOUND: usize = 17;
/// Number of built-in buffer caches.
pub const BUFFER_CLASS_COUNT: usize = BUFFER_SIZES_UPPER_BOUND - BUFFER_SIZES_LOWER_BOUND;


/// The process-global allocator, installed once by [`kmem_init`].
static ALLOCATOR: AtomicPtr<AllocatorHeader> = AtomicPtr::new(null_mut());

fn allocator() -> Option<&'static AllocatorHeader> {
    let header = ALLOCATOR.load(Ordering::Acquire);
    if header.is_null() {
        None
    } else {
        // SAFETY: the header was installed by kmem_init and lives for the
        // process.
        Some(unsafe { &*header })
    }
}

/// Initialize the process-global allocator over the caller's memory.
/// `space` must be aligned to the block size and span at least
/// `block_num * BLOCK_SIZE` bytes; `block_num` must be at least 3.
///
/// # Safety
///
/// The memory must stay owned by the allocator for the rest of the process
/// lifetime. Calling this again replaces the global pool; outstanding
/// pointers into the old pool keep working against the old header.
pub unsafe fn kmem_init(space: *mut u8, block_num: usize) -> Result<(), AllocError> {
    let header = AllocatorHeader::initialize(space, block_num)?;
    ALLOCATOR.store(header as *const AllocatorHeader as *mut AllocatorHeader, Ordering::Release);
    Ok(())
}

/// Create a cache of `size`-byte objects. `name` is truncated to
/// [`MAX_NAME_LENGTH`] - 1 bytes. Returns null when the registry cannot
/// grow or `size` is unusable.
pub fn kmem_cache_create(
    name: &str,
    size: usize,
    ctor: Option<fn(*mut u8)>,
    dtor: Option<fn(*mut u8)>,
) -> *mut CacheHeader {
    match allocator() {
        Some(header) => header.slab().create(header.buddy(), name, size, ctor, dtor),
        None => null_mut(),
    }
}

/// Allocate one object from `cache`. Returns null (with the cache's
/// `NO_MORE_SPACE` bit latched) when the pool is exhausted.
///
/// # Safety
///
/// `cache` must be null or a live handle from [`kmem_cache_create`].
pub unsafe fn kmem_cache_alloc(cache: *mut CacheHeader) -> *mut u8 {
    let Some(header) = allocator() else {
        return null_mut();
    };
    if cache.is_null() {
        return null_mut();
    }

    (*cache).allocate(header.buddy())
}

/// Free one object of `cache`. A pointer the cache does not own only
/// latches the `DEALLOCATING_WRONG_OBJECT` bit.
///
/// # Safety
///
/// `cache` must be null or a live handle; an owned `obj` must be live.
pub unsafe fn kmem_cache_free(cache: *mut CacheHeader, obj: *mut u8) {
    if cache.is_null() || obj.is_null() {
        return;
    }

    (*cache).deallocate(obj);
}

/// Return all empty slabs of `cache` to buddy; returns the number of
/// blocks released.
///
/// # Safety
///
/// `cache` must be null or a live handle from [`kmem_cache_create`].
pub unsafe fn kmem_cache_shrink(cache: *mut CacheHeader) -> usize {
    let Some(header) = allocator() else {
        return 0;
    };
    if cache.is_null() {
        return 0;
    }

    (*cache).shrink(header.buddy())
}

/// Destroy `cache`. A cache with live objects is left intact with its
/// `DESTROYING_NON_EMPTY_CACHE` bit latched.
///
/// # Safety
///
/// `cache` must be null or a live handle; a destroyed handle is dead.
pub unsafe fn kmem_cache_destroy(cache: *mut CacheHeader) {
    let Some(header) = allocator() else {
        return;
    };

    header.slab().destroy(header.buddy(), cache);
}

/// Allocate a small buffer of at least `size` bytes from the built-in
/// power-of-two caches. Sizes above `2^16` bytes have no backing class and
/// return null.
pub fn kmalloc(size: usize) -> *mut u8 {
    match allocator() {
        Some(header) => header.slab().buffer_allocate(header.buddy(), size),
        None => null_mut(),
    }
}

/// [`kmalloc`] followed by zeroing of the requested bytes.
pub fn kzalloc(size: usize) -> *mut u8 {
    let ret = kmalloc(size);
    if !ret.is_null() {
        // SAFETY: the serving class is at least `size` bytes wide.
        unsafe {
            ret.write_bytes(0, size);
        }
    }

    ret
}

/// Free a buffer obtained from [`kmalloc`]. Null is ignored.
///
/// # Safety
///
/// `ptr` must be null or a live buffer returned by [`kmalloc`].
pub unsafe fn kfree(ptr: *const u8) {
    let Some(header) = allocator() else {
        return;
    };

    header.slab().buffer_deallocate(header.buddy(), ptr);
}

/// Log the fixed multi-line report of `cache` at info level.
///
/// # Safety
///
/// `cache` must be null or a live handle from [`kmem_cache_create`].
pub unsafe fn kmem_cache_info(cache: *mut CacheHeader) {
    let Some(header) = allocator() else {
        return;
    };
    if cache.is_null() {
        return;
    }

    let mut out = LogLineWriter::new(log::Level::Info);
    let _ = (*cache).print_info(header, &mut out);
}

/// Log one message per latched error bit of `cache` at error level, then
/// clear the bits and return the prior value.
///
/// # Safety
///
/// `cache` must be null or a live handle from [`kmem_cache_create`].
pub unsafe fn kmem_cache_error(cache: *mut CacheHeader) -> CacheError {
    let Some(header) = allocator() else {
        return CacheError::OK;
    };
    if cache.is_null() {
        return CacheError::OK;
    }

    let mut out = LogLineWriter::new(log::Level::Error);
    (*cache).print_error_info(header, &mut out).unwrap_or(CacheError::OK)
}


/// `fmt::Write` sink forwarding each completed line as one log record.
struct LogLineWriter {
    level: log::Level,
    len: usize,
    buf: [u8; 160],
}

impl LogLineWriter {
    fn new(level: log::Level) -> LogLineWriter {
        LogLineWriter {
            level,
            len: 0,
            buf: [0; 160],
        }
    }

    fn flush(&mut self) {
        if self.len != 0 {
            let line = core::str::from_utf8(&self.buf[..self.len]).unwrap_or("");
            log::log!(self.level, "{}", line);
            self.len = 0;
        }
    }
}

impl fmt::Write for LogLineWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &b in s.as_bytes() {
            if b == b'\n' {
                self.flush();
            } else if self.len < self.buf.len() {
                self.buf[self.len] = b;
                self.len += 1;
            }
        }

        Ok(())
    }
}

impl Drop for LogLineWriter {
    fn drop(&mut self) {
        self.flush();
    }
}
