//! Allocator facade.
//!
//! `Kmem` is the handle callers hold: process-wide init, the cache-of-caches
//! bootstrap, the size-class byte-buffer caches, and `kmalloc`/`kfree`. It
//! replaces the original design's module-global pointers (`kmem_ctrl`,
//! `sem`, `buddy_sem`) with an explicit value threaded through every call -
//! the single-instance assumption behind those globals was never a real
//! invariant, just an artifact of having nowhere else to put the state.

use crate::allocator::buddy::{Buddy, BuddyStats};
use crate::allocator::cache::{Cache, CacheSnapshot};
use crate::error::{KmemError, Result};
use crate::lock::{KmemLock, Guard};

/// Smallest size-class order (`2^5 = 32` bytes).
pub const MIN_BUFF_ORDER: u32 = 5;
/// Largest size-class order (`2^17 = 128 KiB`).
pub const MAX_BUFF_ORDER: u32 = 17;
const SIZE_N_COUNT: usize = (MAX_BUFF_ORDER - MIN_BUFF_ORDER + 1) as usize;

/// One `kmalloc` size class: a cache plus whether anything has ever used it.
#[repr(C)]
struct KmemBuffer {
    cache: Cache,
    used: bool,
}

/// The allocator's self-hosted control block: the cache-of-caches plus
/// every size-class buffer cache, all living inside buddy scratch.
#[repr(C)]
struct KmemCtrl {
    cache: Cache,
    buffers: [KmemBuffer; SIZE_N_COUNT],
}

/// Handle to an initialised allocator instance.
///
/// Cheap to copy: every field is either a bare pointer or a `Buddy` handle,
/// which is itself just a pointer. Safe concurrent use requires every
/// caller to go through the locks this type acquires internally; there is
/// no implicit synchronization from holding a `Kmem` value.
#[derive(Clone, Copy)]
pub struct Kmem {
    buddy: Buddy,
    ctrl: *mut KmemCtrl,
    global_lock: *mut KmemLock,
    buddy_lock: *mut KmemLock,
}

impl Kmem {
    /// Initialise the allocator over `region`, `block_count` blocks long,
    /// bootstrapping the cache-of-caches and the `kmalloc` size classes.
    ///
    /// # Safety
    /// `region` must point to at least `block_count * BLOCK_SIZE` bytes of
    /// valid, exclusively-owned, block-aligned memory that outlives every
    /// use of the returned handle.
    pub unsafe fn init(region: *mut u8, block_count: u64) -> Self {
        debug_assert!(!region.is_null() && block_count > 0);

        let buddy = unsafe { Buddy::init(region, block_count) };

        let ctrl = buddy
            .ctrl_alloc(core::mem::size_of::<KmemCtrl>())
            .expect("control scratch must fit the allocator's own bootstrap structures")
            as *mut KmemCtrl;

        let global_lock = buddy
            .ctrl_alloc(core::mem::size_of::<KmemLock>())
            .expect("control scratch must fit the global lock") as *mut KmemLock;
        let buddy_lock = buddy
            .ctrl_alloc(core::mem::size_of::<KmemLock>())
            .expect("control scratch must fit the buddy lock") as *mut KmemLock;
        unsafe {
            core::ptr::write(global_lock, KmemLock::new());
            core::ptr::write(buddy_lock, KmemLock::new());
        }

        unsafe {
            Cache::init(
                core::ptr::addr_of_mut!((*ctrl).cache),
                "kmem_cache",
                core::mem::size_of::<Cache>(),
                None,
                None,
            );
            Cache::new_slab(core::ptr::addr_of_mut!((*ctrl).cache), buddy);

            for order in MIN_BUFF_ORDER..=MAX_BUFF_ORDER {
                let slot = (order - MIN_BUFF_ORDER) as usize;
                let mut name_buf = [0u8; crate::allocator::cache::CACHE_NAME_LEN];
                let len = write_buffer_name(&mut name_buf, order);
                let name = core::str::from_utf8(&name_buf[..len]).unwrap();

                Cache::init(
                    core::ptr::addr_of_mut!((*ctrl).buffers[slot].cache),
                    name,
                    1usize << order,
                    None,
                    None,
                );
                (*ctrl).buffers[slot].used = false;
            }
        }

        #[cfg(feature = "log")]
        log::debug!(
            "kmem initialised: {} blocks, max_order {}, bootstrap slab order {}",
            block_count,
            buddy.max_order(),
            unsafe { (*ctrl).cache.info().slab_order }
        );

        Self { buddy, ctrl, global_lock, buddy_lock }
    }

    /// Look up a cache by name, creating it if it doesn't already exist.
    ///
    /// Returns `Err(CacheCreate)` if the cache-of-caches itself cannot
    /// produce a new descriptor (its own slabs are exhausted and the buddy
    /// layer cannot back another one).
    pub fn cache_create(
        &self,
        name: &str,
        size: usize,
        ctor: Option<unsafe fn(*mut u8)>,
        dtor: Option<unsafe fn(*mut u8)>,
    ) -> Result<*mut Cache> {
        if size == 0 {
            return Err(KmemError::Arg);
        }

        let _guard = Guard::new(unsafe { &*self.global_lock });

        if let Some(existing) = self.find_cache(name) {
            #[cfg(feature = "log")]
            log::debug!("cache \"{name}\" already registered, returning existing descriptor");
            return Ok(existing);
        }

        let kmem_cache = unsafe { core::ptr::addr_of_mut!((*self.ctrl).cache) };
        let slot = {
            let _buddy_guard = Guard::new(unsafe { &*self.buddy_lock });
            unsafe { Cache::alloc_obj(kmem_cache, self.buddy) }
        };
        let Some(slot) = slot else {
            #[cfg(feature = "log")]
            log::warn!("cache-of-caches exhausted, cannot create \"{name}\"");
            return Err(KmemError::CacheCreate);
        };
        let new_cache = slot as *mut Cache;

        unsafe {
            Cache::init(new_cache, name, size, ctor, dtor);
            (*new_cache).set_next((*kmem_cache).next());
            (*kmem_cache).set_next(new_cache);
        }

        #[cfg(feature = "log")]
        log::debug!("created cache \"{name}\" (object_size={size})");

        Ok(new_cache)
    }

    /// Allocate one object from `cache`.
    pub fn cache_alloc(&self, cache: *mut Cache) -> Option<*mut u8> {
        let _guard = Guard::new(unsafe { &*self.global_lock });
        let _buddy_guard = Guard::new(unsafe { &*self.buddy_lock });
        unsafe { Cache::alloc_obj(cache, self.buddy) }
    }

    /// Return `obj` to `cache`.
    pub fn cache_free(&self, cache: *mut Cache, obj: *mut u8) {
        let _guard = Guard::new(unsafe { (*cache).lock() });
        unsafe { Cache::free_obj(cache, obj) };
    }

    /// Reclaim `cache`'s empty slabs, subject to the grown-since-shrink
    /// heuristic. Returns the number of blocks reclaimed.
    pub fn cache_shrink(&self, cache: *mut Cache) -> u64 {
        let _guard = Guard::new(unsafe { (*cache).lock() });
        let _buddy_guard = Guard::new(unsafe { &*self.buddy_lock });
        unsafe { Cache::shrink(cache, self.buddy) }
    }

    /// Destroy `cache`: free every slab (live objects included), remove it
    /// from the global list, and return its descriptor to the
    /// cache-of-caches.
    ///
    /// The global list removal happens before the per-cache lock is taken,
    /// and the cache-of-caches alloc/free happens after it is released -
    /// `global_lock` is never held at the same time as a per-cache lock.
    pub fn cache_destroy(&self, cache: *mut Cache) {
        #[cfg(feature = "log")]
        let reclaimed_slabs = unsafe { (*cache).info().total_slabs };

        {
            let _guard = Guard::new(unsafe { &*self.global_lock });
            self.unlink_cache(cache);
        }

        {
            let _guard = Guard::new(unsafe { (*cache).lock() });
            let _buddy_guard = Guard::new(unsafe { &*self.buddy_lock });
            unsafe { Cache::destroy_slabs(cache, self.buddy) };
        }

        let _guard = Guard::new(unsafe { &*self.global_lock });
        let kmem_cache = unsafe { core::ptr::addr_of_mut!((*self.ctrl).cache) };
        unsafe { Cache::free_obj(kmem_cache, cache as *mut u8) };

        #[cfg(feature = "log")]
        log::debug!("destroyed cache, reclaiming {reclaimed_slabs} slabs");
    }

    /// Occupancy snapshot for `cache`.
    pub fn cache_info(&self, cache: *mut Cache) -> CacheSnapshot {
        let _guard = Guard::new(unsafe { (*cache).lock() });
        unsafe { (*cache).info() }
    }

    /// Take and clear `cache`'s last latched error.
    pub fn cache_error(&self, cache: *mut Cache) -> Option<KmemError> {
        let _guard = Guard::new(unsafe { (*cache).lock() });
        unsafe { (*cache).error() }
    }

    /// Occupancy snapshot of the underlying buddy layer.
    pub fn buddy_stats(&self) -> BuddyStats {
        let _guard = Guard::new(unsafe { &*self.buddy_lock });
        self.buddy.stats()
    }

    /// Allocate a general-purpose buffer of at least `size` bytes, routed
    /// to the smallest size class that fits.
    pub fn kmalloc(&self, size: usize) -> Result<*mut u8> {
        if size == 0 {
            return Err(KmemError::Arg);
        }

        let _guard = Guard::new(unsafe { &*self.global_lock });

        let mut order = MIN_BUFF_ORDER;
        while (1usize << order) < size {
            order += 1;
        }
        if order > MAX_BUFF_ORDER {
            #[cfg(feature = "log")]
            log::warn!("kmalloc: {size} bytes exceeds the largest size class");
            return Err(KmemError::BuffAlloc);
        }

        let slot = (order - MIN_BUFF_ORDER) as usize;
        let buffer_cache = unsafe { core::ptr::addr_of_mut!((*self.ctrl).buffers[slot].cache) };
        unsafe { (*self.ctrl).buffers[slot].used = true };

        let _buddy_guard = Guard::new(unsafe { &*self.buddy_lock });
        match unsafe { Cache::alloc_obj(buffer_cache, self.buddy) } {
            Some(ptr) => Ok(ptr),
            None => {
                #[cfg(feature = "log")]
                log::warn!("kmalloc: size class for {size} bytes is exhausted");
                Err(KmemError::BuffAlloc)
            }
        }
    }

    /// Free a buffer previously returned by `kmalloc`.
    ///
    /// Scans every size class that has ever been used, partial-then-full
    /// slabs within each - the same cost the original design accepted in
    /// exchange for not tagging buffers with their owning class.
    pub fn kfree(&self, ptr: *mut u8) -> Result<()> {
        let _guard = Guard::new(unsafe { &*self.global_lock });

        for slot in 0..SIZE_N_COUNT {
            if !unsafe { (*self.ctrl).buffers[slot].used } {
                continue;
            }
            let buffer_cache = unsafe { core::ptr::addr_of_mut!((*self.ctrl).buffers[slot].cache) };
            if unsafe { Cache::free_obj(buffer_cache, ptr) } {
                return Ok(());
            }
        }

        #[cfg(feature = "log")]
        log::warn!("kfree: no size class claims {ptr:p}");
        Err(KmemError::BuffFree)
    }

    fn find_cache(&self, name: &str) -> Option<*mut Cache> {
        let mut cur = unsafe { (*self.ctrl).cache.next() };
        while !cur.is_null() {
            if unsafe { (*cur).name() } == name {
                return Some(cur);
            }
            cur = unsafe { (*cur).next() };
        }
        None
    }

    fn unlink_cache(&self, cache: *mut Cache) {
        let kmem_cache = unsafe { core::ptr::addr_of_mut!((*self.ctrl).cache) };
        let mut cur = unsafe { (*kmem_cache).next() };
        let mut prev = kmem_cache;

        while !cur.is_null() {
            if cur == cache {
                unsafe { (*prev).set_next((*cur).next()) };
                unsafe { (*cache).set_next(core::ptr::null_mut()) };
                return;
            }
            prev = cur;
            cur = unsafe { (*cur).next() };
        }
    }
}

// SAFETY: every field is a bare pointer or a `Buddy` handle; synchronization
// is the caller's responsibility via the locks `Kmem`'s methods acquire.
unsafe impl Send for Kmem {}
unsafe impl Sync for Kmem {}

/// Write `"Buffer_<order>"` into `buf`, returning the length written.
/// `order` is always in `MIN_BUFF_ORDER..=MAX_BUFF_ORDER`, i.e. at most two
/// decimal digits.
fn write_buffer_name(buf: &mut [u8; crate::allocator::cache::CACHE_NAME_LEN], order: u32) -> usize {
    let prefix = b"Buffer_";
    buf[..prefix.len()].copy_from_slice(prefix);
    let mut len = prefix.len();

    if order >= 10 {
        buf[len] = b'0' + (order / 10) as u8;
        len += 1;
    }
    buf[len] = b'0' + (order % 10) as u8;
    len += 1;

    len
}
