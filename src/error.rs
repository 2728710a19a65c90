//! Error taxonomy for the allocator.
//!
//! The core never propagates errors through `Result`-returning APIs except
//! where the original design used a status code (`buddy_free`). Everywhere
//! else, failure is a null/`None` return plus a latched code on the cache
//! that produced it - mirroring the C original's `cachep->error` field and
//! the global `print_error` sink, except here the sink is the caller.

use core::fmt;

/// Error codes surfaced by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KmemError {
    /// A required argument was null or zero.
    Arg,
    /// The buddy layer returned no region.
    Malloc,
    /// The buddy layer rejected a free of an out-of-range hook.
    Free,
    /// Growing a cache by one slab failed.
    CacheExpand,
    /// Creating a new cache failed.
    CacheCreate,
    /// No object could be produced by a cache.
    CacheObjAlloc,
    /// A free pointer did not belong to any slab of the cache.
    CacheObjFree,
    /// Equivalent of `CacheExpand`/`CacheObjAlloc` for the size-class path.
    BuffAlloc,
    /// Equivalent of `CacheObjFree` for the size-class path.
    BuffFree,
}

impl fmt::Display for KmemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            KmemError::Arg => "invalid function parameters",
            KmemError::Malloc => "memory allocation failed",
            KmemError::Free => "memory deallocation failed",
            KmemError::CacheExpand => "cache expansion failed",
            KmemError::CacheCreate => "cache creation failed",
            KmemError::CacheObjAlloc => "object allocation failed",
            KmemError::CacheObjFree => "object deallocation failed",
            KmemError::BuffAlloc => "buffer allocation failed",
            KmemError::BuffFree => "buffer deallocation failed",
        };
        f.write_str(text)
    }
}

/// Result alias for the few operations that report failure through a status
/// rather than a null pointer (currently only `Buddy::free`).
pub type Result<T> = core::result::Result<T, KmemError>;
