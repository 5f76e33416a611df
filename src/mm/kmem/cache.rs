//! Per-cache state and operations.
//!
//! A cache owns three slab lists (empty, partial, full), its slab geometry
//! and color rotation, the optional object constructor/destructor pair and
//! the latched error bits, all behind the cache mutex. The registry links
//! (`next`/`prev` and the owning header block) sit outside the mutex; they
//! belong to the slab-header lock.
//!
//! Lock order: a cache operation may descend into buddy while holding the
//! cache mutex (slab growth and shrink); printing takes the cache mutex
//! first, the console write mutex second. Never the reverse.

use core::cmp::max;
use core::fmt;
use core::mem::size_of;
use core::ptr::{self, null_mut};

use log::{debug, warn};
use spin::Mutex;

use crate::error::{AllocError, CacheError};
use crate::mm::block::Block;
use crate::mm::buddy::{ceil_pow2, BuddyHeader};
use crate::mm::{AllocatorHeader, BLOCK_SIZE};
use super::registry::CacheHeaderBlock;
use super::slab::{Slab, SlabList};
use super::{CACHE_L1_LINE_SIZE, MAX_NAME_LENGTH};


/// Slab sizing for one object size: how many blocks a slab spans, how many
/// objects fit, and how many leftover bytes feed the color rotation.
#[derive(Debug, Clone, Copy)]
pub(super) struct SlabGeometry {
    pub(super) blocks_in_slab: usize,
    pub(super) objects_in_slab: usize,
    pub(super) unused_size: usize,
}

/// Compute the slab geometry for `object_size`-byte objects.
///
/// A slab must hold the descriptor, one index entry per object and the
/// objects themselves; the total is rounded to the next power of two (never
/// below one block) so buddy can serve it directly.
pub(super) fn slab_geometry(object_size: usize) -> Result<SlabGeometry, AllocError> {
    if object_size == 0 {
        return Err(AllocError::InvalidArgument);
    }

    let entry_size = object_size
        .checked_add(size_of::<usize>())
        .ok_or(AllocError::Overflow)?;
    let slab_size = max(
        BLOCK_SIZE,
        ceil_pow2(
            entry_size
                .checked_add(size_of::<CacheHeader>())
                .ok_or(AllocError::Overflow)?,
        )?,
    );
    let usable = slab_size - size_of::<CacheHeader>();

    Ok(SlabGeometry {
        blocks_in_slab: slab_size / BLOCK_SIZE,
        objects_in_slab: usable / entry_size,
        unused_size: usable % entry_size,
    })
}


/// Point-in-time counters of one cache.
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    pub object_size: usize,
    pub blocks_in_slab: usize,
    pub objects_in_slab: usize,
    pub slab_count: usize,
    pub allocated_objects: usize,
}

/// One object cache. Lives in a slot of a [`CacheHeaderBlock`].
///
/// [`CacheHeaderBlock`]: super::registry::CacheHeaderBlock
#[repr(C)]
pub struct CacheHeader {
    /// Registry list links, guarded by the slab-header mutex.
    pub(super) next: *mut CacheHeader,
    pub(super) prev: *mut CacheHeader,
    /// Header block this cache's slot was carved from.
    pub(super) block: *mut CacheHeaderBlock,
    inner: Mutex<CacheInner>,
}

// SAFETY: the registry links are only touched under the slab-header mutex,
// everything else is inside the cache mutex.
unsafe impl Send for CacheHeader {}
unsafe impl Sync for CacheHeader {}

pub(super) struct CacheInner {
    full: SlabList,
    partial: SlabList,
    empty: SlabList,

    pub(super) object_size: usize,
    pub(super) blocks_in_slab: usize,
    pub(super) objects_in_slab: usize,

    /// Color offset the next new slab will use.
    next_color: usize,
    /// Leftover bytes per slab; the color modulus.
    unused_size: usize,

    name: [u8; MAX_NAME_LENGTH],

    pub(super) constructor: Option<fn(*mut u8)>,
    pub(super) destructor: Option<fn(*mut u8)>,

    slab_count: usize,
    allocated_objects: usize,

    error: CacheError,
}

// SAFETY: only reachable through the cache mutex.
unsafe impl Send for CacheInner {}

impl CacheHeader {
    /// Initialize a header slot in place.
    ///
    /// # Safety
    ///
    /// `this` must be an unused slot of `block`, owned by the caller (the
    /// registry holds its lock while slots change hands).
    pub(super) unsafe fn initialize(
        this: *mut CacheHeader,
        name: &str,
        object_size: usize,
        constructor: Option<fn(*mut u8)>,
        destructor: Option<fn(*mut u8)>,
        geometry: SlabGeometry,
        block: *mut CacheHeaderBlock,
    ) {
        ptr::write(
            this,
            CacheHeader {
                next: null_mut(),
                prev: null_mut(),
                block,
                inner: Mutex::new(CacheInner {
                    full: SlabList::new(),
                    partial: SlabList::new(),
                    empty: SlabList::new(),
                    object_size,
                    blocks_in_slab: geometry.blocks_in_slab,
                    objects_in_slab: geometry.objects_in_slab,
                    next_color: 0,
                    unused_size: geometry.unused_size,
                    name: copy_name(name),
                    constructor,
                    destructor,
                    slab_count: 0,
                    allocated_objects: 0,
                    error: CacheError::OK,
                }),
            },
        );
    }

    /// Allocate one object. Returns null and latches [`NO_MORE_SPACE`] when
    /// buddy cannot provide blocks for a new slab.
    ///
    /// [`NO_MORE_SPACE`]: CacheError::NO_MORE_SPACE
    pub fn allocate(&self, buddy: &BuddyHeader) -> *mut u8 {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        unsafe {
            // A partially filled slab is the preferred source.
            if !inner.partial.is_empty() {
                let slab = inner.partial.first();
                let Ok(object) = (*slab).allocate(inner) else {
                    debug_assert!(false, "full slab on the partial list");
                    return null_mut();
                };
                if (*slab).is_full(inner) {
                    inner.partial.remove(slab);
                    inner.full.insert(slab);
                }
                inner.allocated_objects += 1;
                return object;
            }

            // Next an empty one, which then moves to partial (or straight
            // to full when a slab holds a single object).
            if !inner.empty.is_empty() {
                let slab = inner.empty.first();
                let Ok(object) = (*slab).allocate(inner) else {
                    debug_assert!(false, "full slab on the empty list");
                    return null_mut();
                };
                inner.empty.remove(slab);
                if inner.objects_in_slab == 1 {
                    inner.full.insert(slab);
                } else {
                    inner.partial.insert(slab);
                }
                inner.allocated_objects += 1;
                return object;
            }

            // No slab has room; grow the cache by one colored slab.
            match buddy.allocate(inner.blocks_in_slab) {
                Ok(run) => {
                    let slab = run as *mut Slab;
                    Slab::initialize(
                        slab,
                        inner.next_color,
                        self as *const CacheHeader as *mut CacheHeader,
                        inner,
                    );
                    if inner.unused_size != 0 {
                        inner.next_color =
                            (inner.next_color + CACHE_L1_LINE_SIZE) % inner.unused_size;
                    }

                    let Ok(object) = (*slab).allocate(inner) else {
                        debug_assert!(false, "fresh slab with no free object");
                        return null_mut();
                    };
                    if inner.objects_in_slab == 1 {
                        inner.full.insert(slab);
                    } else {
                        inner.partial.insert(slab);
                    }
                    inner.slab_count += 1;
                    inner.allocated_objects += 1;

                    debug!(
                        "cache {}: grew to {} slab(s)",
                        name_str(&inner.name),
                        inner.slab_count
                    );
                    object
                }
                Err(err) => {
                    inner.error |= CacheError::NO_MORE_SPACE;
                    warn!("cache {}: slab allocation failed: {}", name_str(&inner.name), err);
                    null_mut()
                }
            }
        }
    }

    /// Free one object. A pointer the cache does not own latches
    /// [`DEALLOCATING_WRONG_OBJECT`] and leaves every slab untouched.
    ///
    /// # Safety
    ///
    /// If `object` belongs to this cache it must be live (allocated and not
    /// yet freed).
    ///
    /// [`DEALLOCATING_WRONG_OBJECT`]: CacheError::DEALLOCATING_WRONG_OBJECT
    pub unsafe fn deallocate(&self, object: *mut u8) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        // Full slabs first: an object being freed usually comes from a slab
        // that stopped serving allocations.
        let found = {
            let inner = &*inner;
            inner.full.find(inner, object)
        };
        if let Some(slab) = found {
            if (*slab).deallocate(inner, object).is_err() {
                inner.error |= CacheError::DEALLOCATING_WRONG_OBJECT;
                return;
            }
            inner.full.remove(slab);
            if inner.objects_in_slab == 1 {
                inner.empty.insert(slab);
            } else {
                inner.partial.insert(slab);
            }
            inner.allocated_objects -= 1;
            return;
        }

        let found = {
            let inner = &*inner;
            inner.partial.find(inner, object)
        };
        if let Some(slab) = found {
            if (*slab).deallocate(inner, object).is_err() {
                inner.error |= CacheError::DEALLOCATING_WRONG_OBJECT;
                return;
            }
            if (*slab).is_empty() {
                inner.partial.remove(slab);
                inner.empty.insert(slab);
            }
            inner.allocated_objects -= 1;
            return;
        }

        warn!(
            "cache {}: rejecting free of foreign pointer {:p}",
            name_str(&inner.name),
            object
        );
        inner.error |= CacheError::DEALLOCATING_WRONG_OBJECT;
    }

    /// Return every empty slab's blocks to buddy. Returns the number of
    /// blocks released.
    pub fn shrink(&self, buddy: &BuddyHeader) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let mut released = 0;
        while !inner.empty.is_empty() {
            let slab = inner.empty.first();
            unsafe {
                inner.empty.remove(slab);
            }
            if buddy.deallocate(slab as *mut Block, inner.blocks_in_slab).is_err() {
                debug_assert!(false, "slab blocks rejected by buddy");
                break;
            }
            inner.slab_count -= 1;
            released += inner.blocks_in_slab;
        }

        if released != 0 {
            debug!(
                "cache {}: shrink released {} block(s)",
                name_str(&inner.name),
                released
            );
        }
        released
    }

    /// Current cache counters.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            object_size: inner.object_size,
            blocks_in_slab: inner.blocks_in_slab,
            objects_in_slab: inner.objects_in_slab,
            slab_count: inner.slab_count,
            allocated_objects: inner.allocated_objects,
        }
    }

    /// Read and clear the latched error bits.
    pub fn take_error(&self) -> CacheError {
        let mut inner = self.inner.lock();
        let error = inner.error;
        inner.error = CacheError::OK;
        error
    }

    /// Write the fixed multi-line cache report. Holds the cache mutex, then
    /// the console write mutex.
    pub fn print_info(&self, header: &AllocatorHeader, out: &mut dyn fmt::Write) -> fmt::Result {
        let inner = self.inner.lock();
        let _console = header.console_guard();

        let capacity = inner.slab_count * inner.objects_in_slab;
        let fill_ratio = if capacity == 0 {
            0.0
        } else {
            inner.allocated_objects as f64 / capacity as f64
        };

        writeln!(out, "Name                          -- {}", name_str(&inner.name))?;
        writeln!(out, "Object size                   -- {}B", inner.object_size)?;
        writeln!(
            out,
            "Cache size                    -- {} Blocks",
            inner.slab_count * inner.blocks_in_slab
        )?;
        writeln!(out, "Number of slabs               -- {}", inner.slab_count)?;
        writeln!(
            out,
            "Number of objects in one slab -- {}",
            inner.objects_in_slab
        )?;
        writeln!(out, "Fill ratio                    -- {}", fill_ratio)
    }

    /// Write one message per latched error bit, then clear the bits and
    /// return the prior value. Holds the cache mutex, then the console
    /// write mutex.
    pub fn print_error_info(
        &self,
        header: &AllocatorHeader,
        out: &mut dyn fmt::Write,
    ) -> Result<CacheError, fmt::Error> {
        let mut inner = self.inner.lock();
        let _console = header.console_guard();

        let error = inner.error;
        if error == CacheError::OK {
            writeln!(out, "No errors")?;
            return Ok(error);
        }

        if error.contains(CacheError::NO_MORE_SPACE) {
            writeln!(out, "No more space for the allocation")?;
        }
        if error.contains(CacheError::DESTROYING_NON_EMPTY_CACHE) {
            writeln!(out, "Destroying a non empty cache is illegal")?;
        }
        if error.contains(CacheError::DEALLOCATING_WRONG_OBJECT) {
            writeln!(out, "Deallocating an object from the wrong slab")?;
        }

        inner.error = CacheError::OK;
        Ok(error)
    }

    pub(super) fn allocated_objects(&self) -> usize {
        self.inner.lock().allocated_objects
    }

    pub(super) fn set_error(&self, error: CacheError) {
        self.inner.lock().error |= error;
    }
}


fn copy_name(name: &str) -> [u8; MAX_NAME_LENGTH] {
    let mut buf = [0u8; MAX_NAME_LENGTH];
    let bytes = name.as_bytes();
    let len = core::cmp::min(bytes.len(), MAX_NAME_LENGTH - 1);
    buf[..len].copy_from_slice(&bytes[..len]);
    buf
}

fn name_str(name: &[u8; MAX_NAME_LENGTH]) -> &str {
    let len = name.iter().position(|&b| b == 0).unwrap_or(MAX_NAME_LENGTH);
    core::str::from_utf8(&name[..len]).unwrap_or("<non-utf8>")
}


#[cfg(test)]
mod tests {
    extern crate std;

    use core::sync::atomic::{AtomicUsize, Ordering};
    use std::string::String;
    use std::vec::Vec;

    use crate::mm::testutil::leak_pool;
    use super::*;

    fn pool(blocks: usize) -> &'static AllocatorHeader {
        let space = leak_pool(blocks);
        unsafe { AllocatorHeader::initialize(space, blocks).unwrap() }
    }

    fn cache<'a>(
        header: &'a AllocatorHeader,
        name: &str,
        object_size: usize,
        ctor: Option<fn(*mut u8)>,
        dtor: Option<fn(*mut u8)>,
    ) -> &'a CacheHeader {
        let cache = header.slab().create(header.buddy(), name, object_size, ctor, dtor);
        assert!(!cache.is_null());
        unsafe { &*cache }
    }

    #[test]
    fn geometry_of_small_objects() {
        let geometry = slab_geometry(20).unwrap();
        let usable = BLOCK_SIZE - size_of::<CacheHeader>();
        assert_eq!(geometry.blocks_in_slab, 1);
        assert_eq!(geometry.objects_in_slab, usable / 28);
        assert_eq!(geometry.unused_size, usable % 28);

        assert!(slab_geometry(0).is_err());
    }

    #[test]
    fn geometry_rounds_to_buddy_runs() {
        // 5000 + index entry + header rounds up to two blocks, one object.
        let geometry = slab_geometry(5000).unwrap();
        assert_eq!(geometry.blocks_in_slab, 2);
        assert_eq!(geometry.objects_in_slab, 1);
    }

    #[test]
    fn alloc_free_roundtrip_and_shrink() {
        let header = pool(130);
        let cache = cache(header, "Cache", 20, None, None);

        let mut objects = Vec::new();
        for _ in 0..10 {
            let object = cache.allocate(header.buddy());
            assert!(!object.is_null());
            objects.push(object);
        }
        let stats = cache.stats();
        assert_eq!(stats.allocated_objects, 10);
        assert_eq!(stats.slab_count, 1);

        for object in objects {
            unsafe { cache.deallocate(object) };
        }
        let stats = cache.stats();
        assert_eq!(stats.allocated_objects, 0);
        assert_eq!(stats.slab_count, 1);

        // The single empty slab is all shrink can release.
        assert_eq!(cache.shrink(header.buddy()), stats.blocks_in_slab);
        assert_eq!(cache.stats().slab_count, 0);
        assert_eq!(cache.take_error(), CacheError::OK);
    }

    static CTOR_CALLS: AtomicUsize = AtomicUsize::new(0);
    static DTOR_CALLS: AtomicUsize = AtomicUsize::new(0);

    fn counting_ctor(object: *mut u8) {
        unsafe { object.cast::<u32>().write(0xC0FFEE) };
        CTOR_CALLS.fetch_add(1, Ordering::Relaxed);
    }

    fn counting_dtor(_object: *mut u8) {
        DTOR_CALLS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn slots_are_constructed_up_front_and_on_free() {
        let header = pool(130);
        let cache = cache(header, "ctor", 64, Some(counting_ctor), Some(counting_dtor));

        let object = cache.allocate(header.buddy());
        let objects_in_slab = cache.stats().objects_in_slab;
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), objects_in_slab);
        assert_eq!(unsafe { object.cast::<u32>().read() }, 0xC0FFEE);

        unsafe {
            object.cast::<u32>().write(0);
            cache.deallocate(object);
        }
        assert_eq!(DTOR_CALLS.load(Ordering::Relaxed), 1);
        assert_eq!(CTOR_CALLS.load(Ordering::Relaxed), objects_in_slab + 1);

        // The freed slot comes back constructed.
        let again = cache.allocate(header.buddy());
        assert_eq!(unsafe { again.cast::<u32>().read() }, 0xC0FFEE);
        unsafe { cache.deallocate(again) };
    }

    #[test]
    fn foreign_pointer_is_rejected() {
        let header = pool(130);
        let a = cache(header, "A", 32, None, None);
        let b = cache(header, "B", 32, None, None);

        let from_b = b.allocate(header.buddy());
        unsafe { a.deallocate(from_b) };

        assert_eq!(a.take_error(), CacheError::DEALLOCATING_WRONG_OBJECT);
        // Error reads are clearing: the second one sees nothing.
        assert_eq!(a.take_error(), CacheError::OK);
        assert_eq!(b.stats().allocated_objects, 1);
        assert_eq!(b.take_error(), CacheError::OK);

        unsafe { b.deallocate(from_b) };
    }

    #[test]
    fn exhaustion_latches_no_more_space() {
        let header = pool(100);
        let cache = cache(header, "big", 2049, None, None);
        assert_eq!(cache.stats().objects_in_slab, 1);

        let mut served = 0;
        let mut failed = false;
        for _ in 0..100 {
            if cache.allocate(header.buddy()).is_null() {
                failed = true;
            } else {
                served += 1;
            }
        }
        assert!(failed);
        assert!(served > 0);
        assert!(cache.take_error().contains(CacheError::NO_MORE_SPACE));
    }

    #[test]
    fn single_object_slabs_skip_partial() {
        let header = pool(130);
        let cache = cache(header, "one", 2049, None, None);

        let object = cache.allocate(header.buddy());
        assert!(!object.is_null());
        assert_eq!(cache.stats().allocated_objects, 1);

        unsafe { cache.deallocate(object) };
        assert_eq!(cache.stats().allocated_objects, 0);

        let blocks_in_slab = cache.stats().blocks_in_slab;
        assert_eq!(cache.shrink(header.buddy()), blocks_in_slab);
    }

    #[test]
    fn successive_slabs_are_colored() {
        let header = pool(130);
        // One object per slab, plenty of leftover bytes to rotate through.
        let cache = cache(header, "color", 2000, None, None);

        let o1 = cache.allocate(header.buddy());
        let o2 = cache.allocate(header.buddy());
        assert_eq!(
            (o2 as usize % BLOCK_SIZE) - (o1 as usize % BLOCK_SIZE),
            CACHE_L1_LINE_SIZE
        );
    }

    #[test]
    fn info_report_format() {
        let header = pool(130);
        let cache = cache(header, "report", 20, None, None);
        let object = cache.allocate(header.buddy());

        let mut out = String::new();
        cache.print_info(header, &mut out).unwrap();

        let mut lines = out.lines();
        assert_eq!(lines.next(), Some("Name                          -- report"));
        assert_eq!(lines.next(), Some("Object size                   -- 20B"));
        assert_eq!(lines.next(), Some("Cache size                    -- 1 Blocks"));
        assert_eq!(lines.next(), Some("Number of slabs               -- 1"));
        assert!(lines
            .next()
            .is_some_and(|l| l.starts_with("Number of objects in one slab -- ")));
        assert!(lines
            .next()
            .is_some_and(|l| l.starts_with("Fill ratio                    -- 0.0")));

        unsafe { cache.deallocate(object) };
    }

    #[test]
    fn error_report_clears_bits() {
        let header = pool(130);
        let cache = cache(header, "err", 20, None, None);

        unsafe { cache.deallocate(0x1000 as *mut u8) };

        let mut out = String::new();
        let prior = cache.print_error_info(header, &mut out).unwrap();
        assert_eq!(prior, CacheError::DEALLOCATING_WRONG_OBJECT);
        assert!(out.contains("Deallocating an object from the wrong slab"));

        out.clear();
        let prior = cache.print_error_info(header, &mut out).unwrap();
        assert_eq!(prior, CacheError::OK);
        assert_eq!(out.trim_end(), "No errors");
    }
}
