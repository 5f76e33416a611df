//! Cache registry: metadata blocks for the caches themselves, and the slab
//! header that owns them.
//!
//! Cache headers are not allocated from caches (that would be circular);
//! instead the registry keeps a list of [`CacheHeaderBlock`]s, each a single
//! buddy-allocated block carved into fixed-size [`CacheHeader`] slots with a
//! `used` and an `unused` list. A block with no used slot left is returned
//! to buddy.
//!
//! The slab header also owns the built-in buffer caches backing
//! [`kmalloc`], one per power-of-two size class.
//!
//! [`kmalloc`]: super::kmalloc

use core::mem::size_of;
use core::ptr::{self, null_mut};

use log::{debug, warn};
use spin::Mutex;

use crate::error::{AllocError, CacheError};
use crate::mm::block::Block;
use crate::mm::buddy::{ceil_pow2, order_of, BuddyHeader};
use crate::mm::{BLOCK_ORDER, BLOCK_SIZE};
use crate::util::align::{align_down, align_up_of};
use super::cache::{slab_geometry, CacheHeader};
use super::slab::Slab;
use super::{BUFFER_CLASS_COUNT, BUFFER_SIZES_LOWER_BOUND, BUFFER_SIZES_UPPER_BOUND};


/// Intrusive list over cache-header slots; links are the `next`/`prev`
/// fields of [`CacheHeader`]. Guarded by the slab-header mutex.
#[repr(C)]
pub(super) struct CacheHeaderList {
    first: *mut CacheHeader,
}

impl CacheHeaderList {
    pub(super) const fn new() -> CacheHeaderList {
        CacheHeaderList { first: null_mut() }
    }

    #[inline(always)]
    pub(super) fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    pub(super) unsafe fn insert(&mut self, element: *mut CacheHeader) {
        (*element).next = self.first;
        (*element).prev = null_mut();
        if !self.first.is_null() {
            (*self.first).prev = element;
        }
        self.first = element;
    }

    pub(super) unsafe fn remove(&mut self, element: *mut CacheHeader) {
        let prev = (*element).prev;
        let next = (*element).next;

        if prev.is_null() {
            self.first = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }

    pub(super) unsafe fn remove_first(&mut self) -> Option<*mut CacheHeader> {
        if self.first.is_null() {
            return None;
        }

        let ret = self.first;
        self.first = (*ret).next;
        if !self.first.is_null() {
            (*self.first).prev = null_mut();
        }

        Some(ret)
    }
}


/// One buddy-allocated block sub-allocating [`CacheHeader`] slots.
#[repr(C)]
pub struct CacheHeaderBlock {
    next: *mut CacheHeaderBlock,
    prev: *mut CacheHeaderBlock,
    used: CacheHeaderList,
    unused: CacheHeaderList,
}

// A block must fit its own header plus at least one cache-header slot.
sa::const_assert!(
    size_of::<CacheHeaderBlock>() + size_of::<CacheHeader>() + core::mem::align_of::<CacheHeader>()
        <= BLOCK_SIZE
);

impl CacheHeaderBlock {
    /// Initialize a freshly allocated block: every slot goes on the
    /// `unused` list.
    ///
    /// # Safety
    ///
    /// `this` must point to one block obtained from buddy.
    pub(super) unsafe fn initialize(this: *mut CacheHeaderBlock) {
        ptr::write(
            this,
            CacheHeaderBlock {
                next: null_mut(),
                prev: null_mut(),
                used: CacheHeaderList::new(),
                unused: CacheHeaderList::new(),
            },
        );

        let (slots, count) = (*this).slots();
        for i in 0..count {
            (*this).unused.insert(slots.add(i));
        }
    }

    /// Whether another cache header can be created here.
    pub(super) fn has_space(&self) -> bool {
        !self.unused.is_empty()
    }

    /// Whether no slot is in use.
    pub(super) fn is_empty(&self) -> bool {
        self.used.is_empty()
    }

    /// Whether `header` is one of this block's slots.
    pub(super) fn contains(&self, header: *const CacheHeader) -> bool {
        let (slots, count) = self.slots();
        let start = slots as usize;
        let end = start + count * size_of::<CacheHeader>();
        (header as usize) >= start && (header as usize) < end
    }

    /// Pop an unused slot and initialize a cache in it.
    pub(super) unsafe fn create(
        &mut self,
        name: &str,
        object_size: usize,
        constructor: Option<fn(*mut u8)>,
        destructor: Option<fn(*mut u8)>,
    ) -> Result<*mut CacheHeader, AllocError> {
        let geometry = slab_geometry(object_size)?;
        let slot = self.unused.remove_first().ok_or(AllocError::OutOfMemory)?;

        CacheHeader::initialize(
            slot,
            name,
            object_size,
            constructor,
            destructor,
            geometry,
            self as *mut CacheHeaderBlock,
        );
        self.used.insert(slot);

        Ok(slot)
    }

    /// Destroy `header` if it has no live objects: shrink it and return its
    /// slot to the `unused` list. A non-empty cache is left unchanged with
    /// its error bit latched, and `false` is returned.
    pub(super) unsafe fn destroy(&mut self, header: *mut CacheHeader, buddy: &BuddyHeader) -> bool {
        if (*header).allocated_objects() != 0 {
            (*header).set_error(CacheError::DESTROYING_NON_EMPTY_CACHE);
            return false;
        }

        (*header).shrink(buddy);

        self.used.remove(header);
        self.unused.insert(header);

        true
    }

    fn slots(&self) -> (*mut CacheHeader, usize) {
        let base = self as *const CacheHeaderBlock as usize;
        let start = align_up_of::<CacheHeader>(base + size_of::<CacheHeaderBlock>());
        let count = (base + BLOCK_SIZE - start) / size_of::<CacheHeader>();
        (start as *mut CacheHeader, count)
    }
}


/// List of cache-header blocks, newest first.
#[repr(C)]
pub(super) struct CacheBlockList {
    first: *mut CacheHeaderBlock,
}

impl CacheBlockList {
    pub(super) const fn new() -> CacheBlockList {
        CacheBlockList { first: null_mut() }
    }

    #[inline(always)]
    pub(super) fn first(&self) -> *mut CacheHeaderBlock {
        self.first
    }

    pub(super) unsafe fn insert(&mut self, element: *mut CacheHeaderBlock) {
        (*element).next = self.first;
        (*element).prev = null_mut();
        if !self.first.is_null() {
            (*self.first).prev = element;
        }
        self.first = element;
    }

    pub(super) unsafe fn remove(&mut self, element: *mut CacheHeaderBlock) {
        let prev = (*element).prev;
        let next = (*element).next;

        if prev.is_null() {
            self.first = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
    }
}


/// Slab-tier root: the registry of cache-header blocks and the built-in
/// buffer caches for sizes `2^5` through `2^16`.
#[repr(C)]
pub struct SlabHeader {
    registry: Mutex<CacheBlockList>,
    /// Written once during bootstrap, read-only afterwards. An entry is
    /// null when the pool was too small to create its cache.
    buffers: [*mut CacheHeader; BUFFER_CLASS_COUNT],
}

// SAFETY: the registry list is behind its mutex; `buffers` is written
// before the header is shared and never again.
unsafe impl Send for SlabHeader {}
unsafe impl Sync for SlabHeader {}

impl SlabHeader {
    pub(in crate::mm) fn new() -> SlabHeader {
        SlabHeader {
            registry: Mutex::new(CacheBlockList::new()),
            buffers: [null_mut(); BUFFER_CLASS_COUNT],
        }
    }

    /// Create the built-in buffer caches. Classes that do not fit the pool
    /// are left null and only reported; a pool without buffer caches is
    /// still a working cache allocator.
    pub(in crate::mm) fn bootstrap(&mut self, buddy: &BuddyHeader) {
        for order in BUFFER_SIZES_LOWER_BOUND..BUFFER_SIZES_UPPER_BOUND {
            let cache = self.create(buddy, "Buffer", 1usize << order, None, None);
            if cache.is_null() {
                warn!("kmem: no space for the {}B buffer cache", 1usize << order);
            }
            self.buffers[order - BUFFER_SIZES_LOWER_BOUND] = cache;
        }
    }

    /// Create a cache, reusing the first header block with a spare slot or
    /// allocating a new one from buddy. Returns null when the size is
    /// unusable or the pool is exhausted.
    pub fn create(
        &self,
        buddy: &BuddyHeader,
        name: &str,
        object_size: usize,
        constructor: Option<fn(*mut u8)>,
        destructor: Option<fn(*mut u8)>,
    ) -> *mut CacheHeader {
        let mut registry = self.registry.lock();

        let mut block = registry.first();
        while !block.is_null() {
            unsafe {
                if (*block).has_space() {
                    return match (*block).create(name, object_size, constructor, destructor) {
                        Ok(header) => {
                            debug!("kmem: created cache {} ({}B objects)", name, object_size);
                            header
                        }
                        Err(err) => {
                            warn!("kmem: cache creation for {} failed: {}", name, err);
                            null_mut()
                        }
                    };
                }
                block = (*block).next;
            }
        }

        // No block has a spare slot; take one more from buddy.
        match buddy.allocate(1) {
            Ok(run) => unsafe {
                let block = run as *mut CacheHeaderBlock;
                CacheHeaderBlock::initialize(block);
                registry.insert(block);

                match (*block).create(name, object_size, constructor, destructor) {
                    Ok(header) => {
                        debug!("kmem: created cache {} ({}B objects)", name, object_size);
                        header
                    }
                    Err(err) => {
                        warn!("kmem: cache creation for {} failed: {}", name, err);
                        null_mut()
                    }
                }
            },
            Err(err) => {
                warn!("kmem: cache header block allocation failed: {}", err);
                null_mut()
            }
        }
    }

    /// Destroy a cache created by [`create`]. Returns `false` when the
    /// header is unknown or the cache still has live objects (the cache's
    /// error bit reports the latter).
    ///
    /// [`create`]: Self::create
    pub fn destroy(&self, buddy: &BuddyHeader, header: *mut CacheHeader) -> bool {
        if header.is_null() {
            return false;
        }

        let mut registry = self.registry.lock();

        let mut block = registry.first();
        while !block.is_null() {
            unsafe {
                if (*block).contains(header) {
                    let destroyed = (*block).destroy(header, buddy);
                    if destroyed && (*block).is_empty() {
                        registry.remove(block);
                        if buddy.deallocate(block as *mut Block, 1).is_err() {
                            debug_assert!(false, "header block rejected by buddy");
                        }
                        debug!("kmem: released an empty cache header block");
                    }
                    return destroyed;
                }
                block = (*block).next;
            }
        }

        false
    }

    /// Serve a [`kmalloc`] request from the buffer cache of the smallest
    /// sufficient size class.
    ///
    /// [`kmalloc`]: super::kmalloc
    pub fn buffer_allocate(&self, buddy: &BuddyHeader, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let Ok(pow) = ceil_pow2(size) else {
            return null_mut();
        };

        // Requests below the smallest class are served from it; requests
        // above the largest have no backing cache.
        let order = core::cmp::max(order_of(pow), BUFFER_SIZES_LOWER_BOUND);
        if order >= BUFFER_SIZES_UPPER_BOUND {
            return null_mut();
        }

        let cache = self.buffers[order - BUFFER_SIZES_LOWER_BOUND];
        if cache.is_null() {
            return null_mut();
        }

        unsafe { (*cache).allocate(buddy) }
    }

    /// Route a [`kfree`] back to the owning cache: the slab descriptor sits
    /// at the start of the block the buffer lives in.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live buffer returned by `buffer_allocate`.
    ///
    /// [`kfree`]: super::kfree
    pub unsafe fn buffer_deallocate(&self, buddy: &BuddyHeader, ptr: *const u8) {
        if ptr.is_null() {
            return;
        }
        if !buddy.contains(ptr) {
            warn!("kmem: kfree of pointer outside the pool: {:p}", ptr);
            return;
        }

        let slab = align_down(ptr as usize, BLOCK_ORDER) as *mut Slab;
        let cache = (*slab).cache;
        if cache.is_null() {
            warn!("kmem: kfree of pointer without an owning cache: {:p}", ptr);
            return;
        }

        (*cache).deallocate(ptr as *mut u8);
    }
}


#[cfg(test)]
mod tests {
    extern crate std;

    use std::vec::Vec;

    use crate::mm::testutil::leak_pool;
    use crate::mm::AllocatorHeader;
    use super::*;

    fn pool(blocks: usize) -> &'static AllocatorHeader {
        let space = leak_pool(blocks);
        unsafe { AllocatorHeader::initialize(space, blocks).unwrap() }
    }

    #[test]
    fn registry_grows_and_releases_header_blocks() {
        let header = pool(200);
        let baseline = header.buddy().stats().free_blocks;

        // Far more caches than the bootstrap blocks have spare slots for.
        let mut caches = Vec::new();
        for _ in 0..30 {
            let cache = header
                .slab()
                .create(header.buddy(), "tmp", 64, None, None);
            assert!(!cache.is_null());
            caches.push(cache);
        }
        assert!(header.buddy().stats().free_blocks < baseline);

        for cache in caches {
            assert!(header.slab().destroy(header.buddy(), cache));
        }
        // Every header block added after the baseline went back to buddy.
        assert_eq!(header.buddy().stats().free_blocks, baseline);
    }

    #[test]
    fn destroy_refuses_non_empty_cache() {
        let header = pool(130);
        let cache = header
            .slab()
            .create(header.buddy(), "hold", 64, None, None);
        assert!(!cache.is_null());

        unsafe {
            let object = (*cache).allocate(header.buddy());
            assert!(!object.is_null());

            assert!(!header.slab().destroy(header.buddy(), cache));
            assert_eq!(
                (*cache).take_error(),
                CacheError::DESTROYING_NON_EMPTY_CACHE
            );

            (*cache).deallocate(object);
        }
        assert!(header.slab().destroy(header.buddy(), cache));

        assert!(!header.slab().destroy(header.buddy(), core::ptr::null_mut()));
    }

    #[test]
    fn create_rejects_zero_sized_objects() {
        let header = pool(130);
        let cache = header.slab().create(header.buddy(), "zero", 0, None, None);
        assert!(cache.is_null());
    }

    #[test]
    fn buffer_classes_route_by_size() {
        let header = pool(200);
        let slab = header.slab();
        let buddy = header.buddy();

        // 6 bytes round up to the smallest (32B) class.
        let small = slab.buffer_allocate(buddy, 6);
        assert!(!small.is_null());
        let exact = slab.buffer_allocate(buddy, 4096);
        assert!(!exact.is_null());

        assert!(slab.buffer_allocate(buddy, 0).is_null());
        assert!(slab.buffer_allocate(buddy, (1usize << 16) + 1).is_null());

        unsafe {
            slab.buffer_deallocate(buddy, small);
            slab.buffer_deallocate(buddy, exact);

            // A pointer from outside the pool is ignored.
            let local = [0u8; 8];
            slab.buffer_deallocate(buddy, local.as_ptr());
        }
    }
}
