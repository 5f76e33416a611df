//! Allocator error definitions.

use core::fmt;

use bitflags::bitflags;


/// Failure raised by the buddy tier and the low-level helpers. Detected at
/// the point of failure and propagated with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Null or out-of-pool pointer, zero size, bad alignment, or a free of
    /// a block that is not currently allocated.
    InvalidArgument,
    /// Bit or block index outside of the managed range.
    OutOfRange,
    /// No free run of sufficient size is left in the pool.
    OutOfMemory,
    /// The requested size has no power-of-two ceiling in `usize` range.
    Overflow,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AllocError::InvalidArgument => "invalid argument",
            AllocError::OutOfRange => "index out of range",
            AllocError::OutOfMemory => "out of memory",
            AllocError::Overflow => "size overflow",
        };
        f.write_str(msg)
    }
}

bitflags! {
    /// Per-cache error state. Bits are latched on the cache until read (and
    /// cleared) by [`kmem_cache_error`]; they are combinable.
    ///
    /// [`kmem_cache_error`]: crate::mm::kmem::kmem_cache_error
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CacheError: u32 {
        /// The buddy tier could not provide blocks for a new slab.
        const NO_MORE_SPACE = 1;
        /// A destroy was requested on a cache with live objects.
        const DESTROYING_NON_EMPTY_CACHE = 2;
        /// A deallocation was requested for a pointer the cache does not own.
        const DEALLOCATING_WRONG_OBJECT = 4;
    }
}

impl CacheError {
    /// The no-error state.
    pub const OK: CacheError = CacheError::empty();
}
