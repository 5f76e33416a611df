//! Block definition and the intrusive free-list discipline of the buddy
//! tier.
//!
//! A free block stores its own list links and current order in its first
//! bytes; the rest of the block memory is dead weight until it is allocated
//! again. An allocated block is opaque to the allocator, so the metadata
//! costs nothing.

use crate::error::AllocError;
use crate::mm::BLOCK_SIZE;


/// Free-block metadata overlaid on the first bytes of a free block.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct BlockInfo {
    pub next: *mut Block,
    pub prev: *mut Block,
    /// Order of the free run this block is heading.
    pub order: usize,
}

/// One pool block. Free blocks are viewed through `info`, allocated blocks
/// through `bytes`.
#[repr(C, align(4096))]
pub union Block {
    pub info: BlockInfo,
    pub bytes: [u8; BLOCK_SIZE],
}

sa::const_assert_eq!(core::mem::size_of::<Block>(), BLOCK_SIZE);


/// Push `block` at the head of the list.
///
/// # Safety
///
/// `head` must be a valid free-list head and `block` an unlinked pool block.
pub unsafe fn insert(head: &mut *mut Block, block: *mut Block) -> Result<(), AllocError> {
    if block.is_null() {
        return Err(AllocError::InvalidArgument);
    }

    (*block).info.next = *head;
    (*block).info.prev = core::ptr::null_mut();
    if !head.is_null() {
        (**head).info.prev = block;
    }
    *head = block;

    Ok(())
}

/// Pop the first block of the list.
///
/// # Safety
///
/// `head` must be a valid free-list head.
pub unsafe fn remove_first(head: &mut *mut Block) -> Result<*mut Block, AllocError> {
    if head.is_null() {
        return Err(AllocError::InvalidArgument);
    }

    let block = *head;
    *head = (*block).info.next;
    if !head.is_null() {
        (**head).info.prev = core::ptr::null_mut();
    }

    Ok(block)
}

/// Unlink `block` from the list in O(1) using both neighbors.
///
/// # Safety
///
/// `block` must actually be linked from `head`; an unlinked block is only
/// detected when it claims to be the head without being it.
pub unsafe fn remove(head: &mut *mut Block, block: *mut Block) -> Result<(), AllocError> {
    if head.is_null() || block.is_null() {
        return Err(AllocError::InvalidArgument);
    }

    let prev = (*block).info.prev;
    let next = (*block).info.next;

    if prev.is_null() {
        if *head != block {
            return Err(AllocError::InvalidArgument);
        }
        *head = next;
    } else {
        (*prev).info.next = next;
    }
    if !next.is_null() {
        (*next).info.prev = prev;
    }

    Ok(())
}
