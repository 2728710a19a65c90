//! Lock abstraction.
//!
//! The core treats mutual exclusion as an injected collaborator: it only
//! ever calls `acquire`/`release` on an opaque handle, blocking, no
//! recursion, no try-acquire, fairness unspecified. `KmemLock` is the
//! concrete handle used throughout this crate, built on `spin::Mutex`
//! exactly the way the rest of the allocator stack (`tiered.rs`'s
//! `MemoryPool`) leans on `spin` for no_std mutual exclusion.
//!
//! Unlike the original C, which placement-constructed a mutex into a
//! caller-supplied `mutex_space: [u8; MUTEX_SIZE]` buffer because C has no
//! way to embed an opaque-sized type by value, a `KmemLock` is Sized and is
//! simply embedded as a struct field wherever the original embedded
//! `mutex_space` - there is no separate storage buffer to manage.

use spin::Mutex;

/// A blocking mutual-exclusion handle with manual acquire/release.
///
/// This is deliberately not RAII-guarded: the core's call sites
/// (`cache.rs`, `facade.rs`) acquire a lock, perform several operations that
/// may themselves need to acquire a *different* lock (see the nesting rule
/// in the crate's module docs), and release explicitly - matching
/// `wait()`/`signal()` pairs in the original.
pub struct KmemLock(Mutex<()>);

impl KmemLock {
    /// Build a new, unlocked handle.
    pub const fn new() -> Self {
        Self(Mutex::new(()))
    }

    /// Block until the lock is held.
    pub fn acquire(&self) {
        core::mem::forget(self.0.lock());
    }

    /// Release a lock previously obtained with `acquire`.
    ///
    /// # Safety
    /// The caller must hold the lock (via a prior `acquire` on this same
    /// handle) and must not call this twice for one `acquire`.
    pub unsafe fn release(&self) {
        unsafe {
            self.0.force_unlock();
        }
    }
}

impl Default for KmemLock {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII wrapper that pairs an `acquire` with a `release`, so call sites read
/// like a normal critical section while the underlying primitive stays a
/// manual acquire/release handle (useful once a lock must outlive a single
/// expression, e.g. across a slab scan).
pub struct Guard<'a>(&'a KmemLock);

impl<'a> Guard<'a> {
    /// Acquire `lock` and return a guard that releases it on drop.
    pub fn new(lock: &'a KmemLock) -> Self {
        lock.acquire();
        Self(lock)
    }
}

impl Drop for Guard<'_> {
    fn drop(&mut self) {
        unsafe {
            self.0.release();
        }
    }
}

// SAFETY: KmemLock only ever exposes synchronized access to the unit value
// it wraps; sharing the handle across threads is the entire point.
unsafe impl Send for KmemLock {}
unsafe impl Sync for KmemLock {}
