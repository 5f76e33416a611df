//! Block allocation bitmap.
//!
//! One [`BitMapBlock`] is a block-wide bit array covering
//! [`ENTRIES_IN_BITMAP`] managed blocks: bit `i` set means the `i`-th block
//! of the bitmap's range is currently allocated. Bit `i` lives in byte
//! `i / 8` under mask `1 << (i % 8)`.
//!
//! A run that crosses a bitmap-block boundary is split by the caller into
//! per-bitmap sub-operations (see the buddy tier).

use crate::error::AllocError;
use crate::mm::BLOCK_SIZE;
use crate::util::bit::{clear_bit, set_bit, test_bit};


/// Number of blocks tracked by one bitmap block.
pub const ENTRIES_IN_BITMAP: usize = BLOCK_SIZE * 8;

/// A block-sized allocation bit array.
#[repr(C, align(4096))]
pub struct BitMapBlock {
    bytes: [u8; BLOCK_SIZE],
}

sa::const_assert_eq!(core::mem::size_of::<BitMapBlock>(), BLOCK_SIZE);

impl BitMapBlock {
    /// Clear the whole map to the all-free state.
    pub fn reset(&mut self) {
        self.bytes.fill(0);
    }

    /// Mark `count` consecutive blocks starting at `index` as allocated.
    pub fn allocate(&mut self, index: usize, count: usize) -> Result<(), AllocError> {
        self.insert_values(index, count, true)
    }

    /// Mark `count` consecutive blocks starting at `index` as free.
    pub fn deallocate(&mut self, index: usize, count: usize) -> Result<(), AllocError> {
        self.insert_values(index, count, false)
    }

    /// Read the allocation bit of the block at `index`.
    pub fn is_allocated(&self, index: usize) -> Result<bool, AllocError> {
        if index >= ENTRIES_IN_BITMAP {
            return Err(AllocError::OutOfRange);
        }

        Ok(test_bit(&self.bytes, index))
    }

    fn insert_values(&mut self, index: usize, count: usize, value: bool) -> Result<(), AllocError> {
        let end = index.checked_add(count).ok_or(AllocError::OutOfRange)?;
        if end > ENTRIES_IN_BITMAP {
            return Err(AllocError::OutOfRange);
        }

        for i in index..end {
            if value {
                set_bit(&mut self.bytes, i);
            } else {
                clear_bit(&mut self.bytes, i);
            }
        }

        Ok(())
    }
}
