//! Two-tier memory allocator over a caller-provided pool of 4 KiB blocks.
//!
//! The pool is handed to the allocator once, at [`kmem_init`] (or
//! [`AllocatorHeader::initialize`] for a non-global pool), and no memory is
//! ever requested from the host after that. Block 0 of the pool holds the
//! allocator header; the rest is managed in two tiers:
//!
//! | Tier | Unit | Description |
//! | ---- | ---- | ----------- |
//! | buddy | run of `2^k` blocks | Free lists per order, bitmap bookkeeping, split on allocate and buddy-coalescing on free. |
//! | slab | object | Per-cache slabs carved out of buddy runs, with free-object index chains, cache coloring and small general-purpose buffer classes backing [`kmalloc`]. |
//!
//! The `kmem_*` functions form the C-style facade over a process-global
//! allocator. The underlying headers ([`mm::buddy::BuddyHeader`],
//! [`mm::kmem::SlabHeader`], [`mm::kmem::CacheHeader`]) are usable directly
//! with an explicitly passed pool, so independent pools can coexist in one
//! process.
//!
//! [`kmem_init`]: crate::mm::kmem::kmem_init
//! [`kmalloc`]: crate::mm::kmem::kmalloc
//! [`AllocatorHeader::initialize`]: crate::mm::AllocatorHeader::initialize

#![no_std]

pub mod error;
pub mod mm;
mod util;

pub use error::{AllocError, CacheError};
pub use mm::kmem::{
    kfree, kmalloc, kmem_cache_alloc, kmem_cache_create, kmem_cache_destroy, kmem_cache_error,
    kmem_cache_free, kmem_cache_info, kmem_cache_shrink, kmem_init, kzalloc,
};
pub use mm::AllocatorHeader;
