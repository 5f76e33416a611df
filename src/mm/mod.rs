//! Pool memory management. Owns the global allocator header and does the
//! one-time initialization of both tiers.
//!
//! The caller provides one contiguous region of `N` blocks, aligned to the
//! block size. The region is laid out as follows and never grows:
//!
//! | Block | Content |
//! | ----- | ------- |
//! | 0 | [`AllocatorHeader`]: buddy header, slab header, console write mutex. |
//! | 1.. | Buddy bitmap block(s), then the managed free pool. |
//!
//! Initialization order matters: the buddy tier is built first over blocks
//! `1..N-1`, then the slab tier bootstraps its built-in buffer caches from
//! buddy memory.
//!
//! [`AllocatorHeader`]: self::AllocatorHeader

pub mod bitmap;
pub mod block;
pub mod buddy;
pub mod kmem;

use core::ptr;

use log::info;
use spin::{Mutex, MutexGuard};

use crate::error::AllocError;
use crate::mm::block::Block;
use crate::mm::buddy::BuddyHeader;
use crate::mm::kmem::SlabHeader;


/// Order of block-size.
pub const BLOCK_ORDER: usize = 12;
/// Block size. The pool management unit of both tiers.
pub const BLOCK_SIZE: usize = 1 << 12;

/// Minimal pool size: one block for the allocator header, one for the buddy
/// bitmap, one of managed memory.
pub const MIN_SIZE_IN_BLOCKS: usize = 3;


/// The global allocator state, installed in block 0 of the pool.
#[repr(C)]
pub struct AllocatorHeader {
    size_in_blocks: usize,
    buddy: BuddyHeader,
    slab: SlabHeader,
    console_lock: Mutex<()>,
}

// The header must share block 0 with nothing else.
sa::const_assert!(core::mem::size_of::<AllocatorHeader>() <= BLOCK_SIZE);

impl AllocatorHeader {
    /// Install an allocator over the caller's memory and initialize both
    /// tiers. `space` must be aligned to [`BLOCK_SIZE`] and point to at
    /// least `size_in_blocks * BLOCK_SIZE` bytes.
    ///
    /// # Safety
    ///
    /// The memory must stay owned by the allocator (unread and unwritten by
    /// the caller) for the lifetime of the returned reference.
    pub unsafe fn initialize(
        space: *mut u8,
        size_in_blocks: usize,
    ) -> Result<&'static AllocatorHeader, AllocError> {
        if space.is_null() || space as usize % BLOCK_SIZE != 0 {
            return Err(AllocError::InvalidArgument);
        }
        if size_in_blocks < MIN_SIZE_IN_BLOCKS {
            return Err(AllocError::InvalidArgument);
        }

        let first_pool_block = space.add(BLOCK_SIZE) as *mut Block;
        let buddy = BuddyHeader::initialize(first_pool_block, size_in_blocks - 1)?;

        let this = space as *mut AllocatorHeader;
        ptr::write(
            this,
            AllocatorHeader {
                size_in_blocks,
                buddy,
                slab: SlabHeader::new(),
                console_lock: Mutex::new(()),
            },
        );

        // The header is not shared yet, so the split borrow below is the
        // only access.
        let header = &mut *this;
        header.slab.bootstrap(&header.buddy);

        info!(
            "kpool: initialized over {} blocks ({} KiB) at {:p}",
            size_in_blocks,
            size_in_blocks * BLOCK_SIZE / 1024,
            space
        );

        Ok(&*this)
    }

    /// Total pool size, in blocks, including the header block.
    #[inline(always)]
    pub fn size_in_blocks(&self) -> usize {
        self.size_in_blocks
    }

    /// The buddy tier of this pool.
    #[inline(always)]
    pub fn buddy(&self) -> &BuddyHeader {
        &self.buddy
    }

    /// The slab tier of this pool.
    #[inline(always)]
    pub fn slab(&self) -> &SlabHeader {
        &self.slab
    }

    /// Take the console write mutex. Serializes multi-line human-readable
    /// output; acquired only while printing, after any cache mutex.
    pub fn console_guard(&self) -> MutexGuard<'_, ()> {
        self.console_lock.lock()
    }
}
