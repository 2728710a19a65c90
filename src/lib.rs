//! A two-layer kernel-style memory allocator: a buddy allocator managing
//! power-of-two block runs over a single caller-supplied region, and a slab
//! allocator layered on top for typed-object caching, wrapped in a facade
//! that provides `kmem_init`-style initialisation plus `kmalloc`/`kfree`.
//!
//! # Layout
//!
//! - [`block`] - pure size/order arithmetic (no state).
//! - [`allocator::buddy`] - the buddy layer: free lists, split, coalesce.
//! - [`lock`] - the blocking mutual-exclusion handle every lock in this
//!   crate is built from.
//! - [`allocator::slab`] - one buddy run reinterpreted as a header, bitmap,
//!   and object array.
//! - [`allocator::cache`] - a named collection of same-sized-object slabs.
//! - [`allocator::facade`] - process-wide init, the cache-of-caches,
//!   `kmalloc`/`kfree`.
//!
//! # Concurrency
//!
//! Every lock in this crate is a [`lock::KmemLock`]: blocking acquire,
//! explicit release, no recursion, no try-acquire. [`allocator::facade::Kmem`]
//! owns a `global_lock` (cache-of-caches list, size-class `used` flags) and a
//! `buddy_lock` (free lists, scratch cursor); each [`allocator::cache::Cache`]
//! owns its own lock for free/shrink/destroy/info. Either `global_lock` or a
//! per-cache lock may nest `buddy_lock` around any call that actually
//! touches the buddy layer (growing a cache by a slab, reclaiming slabs on
//! shrink or destroy); `global_lock` is never held while a per-cache lock is
//! held - `Kmem::cache_destroy` releases the global lock before taking the
//! per-cache lock, and reacquires it afterwards to return the cache
//! descriptor to the cache-of-caches.
//!
//! # No heap primitives
//!
//! Nothing in `allocator` or `block` allocates from a Rust heap allocator:
//! every structure above block 0 lives inside memory handed out by the
//! buddy layer itself, addressed by raw pointer or block index. This is a
//! deliberate constraint, not an oversight - the whole point of the buddy
//! layer is to be the allocator memory comes from, not a consumer of one.

#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod allocator;
pub mod block;
pub mod error;
pub mod lock;

pub use allocator::buddy::{BlockHook, Buddy, BuddyStats};
pub use allocator::cache::{Cache, CacheSnapshot, Extended};
pub use allocator::facade::{Kmem, MAX_BUFF_ORDER, MIN_BUFF_ORDER};
pub use allocator::slab::{Slab, SlabState};
pub use block::BLOCK_SIZE;
pub use error::{KmemError, Result};
pub use lock::{Guard, KmemLock};
