//! In-slab object layout and per-slab bookkeeping.
//!
//! A slab is one buddy-allocated run laid out as:
//!
//! ```text
//! +-----------------+---------------------+---------------+----------+-----+----------------+
//! | slab descriptor | index_array[K]      | color padding | object_0 | ... | object_{K - 1} |
//! +-----------------+---------------------+---------------+----------+-----+----------------+
//! ```
//!
//! The index array encodes a singly linked chain of free object indices:
//! `index_array[i]` holds the index of the next free object after `i`, the
//! chain head is `free_index`, and the last free entry holds [`NULL_INDEX`].
//! Allocation pops the chain head, deallocation pushes an index back, both
//! in O(1).
//!
//! All slab state is guarded by the owning cache's mutex; nothing here
//! takes a lock.

use core::mem::size_of;
use core::ptr::{self, null_mut};

use crate::error::AllocError;
use super::cache::{CacheHeader, CacheInner};


/// The all-ones sentinel terminating the in-slab free-object chain.
pub const NULL_INDEX: usize = usize::MAX;


/// Slab descriptor, stored in the first bytes of the slab's first block.
#[repr(C)]
pub struct Slab {
    next: *mut Slab,
    prev: *mut Slab,
    /// Free-chain storage; entry `i` names the next free object after `i`.
    index_array: *mut usize,
    /// First free object, or [`NULL_INDEX`] when the slab is full.
    free_index: usize,
    allocated: usize,
    objects_start: *mut u8,
    /// Owning cache. Read without the cache lock by the buffer free path,
    /// which is safe because the field never changes after initialization.
    pub(super) cache: *mut CacheHeader,
}

// The descriptor must leave room for at least one index entry in a block.
sa::const_assert!(size_of::<Slab>() + size_of::<usize>() <= crate::mm::BLOCK_SIZE);

impl Slab {
    /// Lay the descriptor, index array and color-shifted object array over
    /// the slab's blocks, chain all objects free and run the constructor
    /// once over every slot.
    ///
    /// # Safety
    ///
    /// `this` must point to `inner.blocks_in_slab` blocks freshly obtained
    /// from buddy; `inner` must be the locked state of `cache`.
    pub(super) unsafe fn initialize(
        this: *mut Slab,
        color_offset: usize,
        cache: *mut CacheHeader,
        inner: &CacheInner,
    ) {
        let start = this as *mut u8;
        let index_array = start.add(size_of::<Slab>()) as *mut usize;
        let objects_start = (index_array.add(inner.objects_in_slab) as *mut u8).add(color_offset);

        ptr::write(
            this,
            Slab {
                next: null_mut(),
                prev: null_mut(),
                index_array,
                free_index: 0,
                allocated: 0,
                objects_start,
                cache,
            },
        );

        for i in 1..inner.objects_in_slab {
            *index_array.add(i - 1) = i;
        }
        *index_array.add(inner.objects_in_slab - 1) = NULL_INDEX;

        debug_assert!(
            objects_start.add(inner.objects_in_slab * inner.object_size)
                <= start.add(inner.blocks_in_slab * crate::mm::BLOCK_SIZE)
        );

        if let Some(ctor) = inner.constructor {
            for i in 0..inner.objects_in_slab {
                ctor((*this).object_at(inner, i));
            }
        }
    }

    /// Pop the first free object. Fails when the slab is exhausted.
    pub(super) unsafe fn allocate(&mut self, inner: &CacheInner) -> Result<*mut u8, AllocError> {
        if self.free_index == NULL_INDEX {
            return Err(AllocError::OutOfMemory);
        }

        let ret = self.object_at(inner, self.free_index);
        self.free_index = *self.index_array.add(self.free_index);
        self.allocated += 1;

        Ok(ret)
    }

    /// Return `object` to the free chain, re-initializing the slot
    /// (destructor, then constructor) so the next allocation hands out a
    /// constructed object.
    pub(super) unsafe fn deallocate(
        &mut self,
        inner: &CacheInner,
        object: *mut u8,
    ) -> Result<(), AllocError> {
        let index = self.index_of(inner, object)?;

        if let Some(dtor) = inner.destructor {
            dtor(object);
        }
        if let Some(ctor) = inner.constructor {
            ctor(object);
        }

        *self.index_array.add(index) = self.free_index;
        self.free_index = index;
        self.allocated -= 1;

        Ok(())
    }

    /// Whether `object` points exactly at one of this slab's object slots.
    pub(super) fn contains(&self, inner: &CacheInner, object: *const u8) -> bool {
        if !self.object_in_range(inner, object) {
            return false;
        }

        (object as usize - self.objects_start as usize) % inner.object_size == 0
    }

    #[inline(always)]
    pub(super) fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    #[inline(always)]
    pub(super) fn is_full(&self, inner: &CacheInner) -> bool {
        self.allocated == inner.objects_in_slab
    }

    fn object_at(&self, inner: &CacheInner, index: usize) -> *mut u8 {
        debug_assert!(index < inner.objects_in_slab);
        unsafe { self.objects_start.add(index * inner.object_size) }
    }

    fn index_of(&self, inner: &CacheInner, object: *const u8) -> Result<usize, AllocError> {
        if !self.object_in_range(inner, object) {
            return Err(AllocError::InvalidArgument);
        }

        let diff = object as usize - self.objects_start as usize;
        if diff % inner.object_size != 0 {
            return Err(AllocError::InvalidArgument);
        }

        Ok(diff / inner.object_size)
    }

    fn object_in_range(&self, inner: &CacheInner, object: *const u8) -> bool {
        let start = self.objects_start as usize;
        let last = start + (inner.objects_in_slab - 1) * inner.object_size;
        (object as usize) >= start && (object as usize) <= last
    }
}


/// List of slabs in one cache state (empty, partial or full). Keeps both
/// ends so insertion appends at the tail and the allocation path keeps
/// draining the oldest slab first.
#[repr(C)]
pub(super) struct SlabList {
    first: *mut Slab,
    last: *mut Slab,
}

impl SlabList {
    pub(super) const fn new() -> SlabList {
        SlabList {
            first: null_mut(),
            last: null_mut(),
        }
    }

    #[inline(always)]
    pub(super) fn is_empty(&self) -> bool {
        self.first.is_null()
    }

    /// First slab of the list; only meaningful on a non-empty list.
    #[inline(always)]
    pub(super) fn first(&self) -> *mut Slab {
        self.first
    }

    /// Append `slab` at the tail.
    pub(super) unsafe fn insert(&mut self, slab: *mut Slab) {
        (*slab).next = null_mut();
        (*slab).prev = self.last;
        if self.first.is_null() {
            self.first = slab;
        } else {
            (*self.last).next = slab;
        }
        self.last = slab;
    }

    /// Unlink `slab` from the list.
    pub(super) unsafe fn remove(&mut self, slab: *mut Slab) {
        let prev = (*slab).prev;
        let next = (*slab).next;

        if prev.is_null() {
            self.first = next;
        } else {
            (*prev).next = next;
        }
        if next.is_null() {
            self.last = prev;
        } else {
            (*next).prev = prev;
        }
    }

    /// Find the slab owning `object`, if any.
    pub(super) fn find(&self, inner: &CacheInner, object: *const u8) -> Option<*mut Slab> {
        let mut cur = self.first;
        while !cur.is_null() {
            unsafe {
                if (*cur).contains(inner, object) {
                    return Some(cur);
                }
                cur = (*cur).next;
            }
        }

        None
    }
}
