//! Cache layer.
//!
//! A `Cache` owns every slab of one object size: three state lists
//! (`Empty`/`Partial`/`Full`), the layout numbers derived once at creation
//! (`slab_order`, `obj_per_slab`, `max_alignments`), optional constructor
//! and destructor hooks, and its own lock. Caches themselves are not
//! heap-allocated: the cache-of-caches (built in `facade.rs`) hands them
//! out as slab objects of its own, the same self-hosting trick the
//! original design uses to bootstrap its own metadata.

use crate::allocator::buddy::Buddy;
use crate::allocator::slab::{Slab, SlabState};
use crate::block::{L1_LINE, size_of_blocks};
use crate::error::KmemError;
use crate::lock::KmemLock;

/// Maximum cache name length, including any trailing NUL.
pub const CACHE_NAME_LEN: usize = 32;

/// Minimum objects a slab must hold; the original design's `MIN_OBJ_CNT`.
const MIN_OBJ_CNT: usize = 1;

/// A cache's growth state since its last `shrink`.
///
/// Encoded as a three-variant tag rather than a signed counter: the shrink
/// rule only ever asks "did this grow since last time", never "by how
/// much".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extended {
    /// Never shrunk and never grown - the state right after creation.
    Untouched,
    /// Shrunk (or created) and not grown since.
    Stable,
    /// Grown by at least one slab since the last shrink.
    Grown,
}

/// Point-in-time occupancy snapshot, handed to an external presenter.
#[derive(Debug, Clone, Copy)]
pub struct CacheSnapshot {
    /// Size in bytes of one object.
    pub object_size: usize,
    /// `log2` of the slab size in blocks.
    pub slab_order: u32,
    /// Objects that fit in one slab.
    pub obj_per_slab: usize,
    /// Slabs currently owned by this cache.
    pub total_slabs: u32,
    /// Objects currently allocated across all slabs.
    pub used_objects: u32,
    /// `total_slabs * obj_per_slab`.
    pub total_objects: u32,
    /// `100 * used_objects / total_objects`, or `0.0` with no slabs.
    pub usage_percent: f64,
}

/// One size/type's worth of slabs.
#[repr(C)]
pub struct Cache {
    name: [u8; CACHE_NAME_LEN],
    heads: [*mut Slab; 3],
    slab_count: [u32; 3],
    pub(crate) object_size: usize,
    pub(crate) bitmap_length: usize,
    pub(crate) slab_order: u32,
    next_offset: u32,
    pub(crate) obj_per_slab: usize,
    pub(crate) max_alignments: u32,
    pub(crate) ctor: Option<unsafe fn(*mut u8)>,
    pub(crate) dtor: Option<unsafe fn(*mut u8)>,
    extended: Extended,
    error: Option<KmemError>,
    lock: KmemLock,
    next: *mut Cache,
}

impl Cache {
    /// Compute the layout numbers for objects of `object_size` and write
    /// them, plus every other field, into `cache` in place.
    ///
    /// # Safety
    /// `cache` must point to valid, writable memory for one `Cache`.
    pub(crate) unsafe fn init(
        cache: *mut Cache,
        name: &str,
        object_size: usize,
        ctor: Option<unsafe fn(*mut u8)>,
        dtor: Option<unsafe fn(*mut u8)>,
    ) {
        let slab_order = Slab::calc_slab_order(object_size);
        let slab_size = size_of_blocks(slab_order);
        let free = slab_size - core::mem::size_of::<Slab>();

        let mut obj_count = 0usize;
        let mut bitmap_size = 0usize;
        while bitmap_size + obj_count * object_size <= free {
            obj_count += 1;
            bitmap_size = obj_count.div_ceil(8);
        }
        obj_count -= 1;
        bitmap_size = obj_count.div_ceil(8);
        let waste = free - (bitmap_size + obj_count * object_size);
        debug_assert!(obj_count >= MIN_OBJ_CNT);

        let mut name_buf = [0u8; CACHE_NAME_LEN];
        let bytes = name.as_bytes();
        let n = bytes.len().min(CACHE_NAME_LEN - 1);
        name_buf[..n].copy_from_slice(&bytes[..n]);

        unsafe {
            (*cache).name = name_buf;
            (*cache).heads = [core::ptr::null_mut(); 3];
            (*cache).slab_count = [0; 3];
            (*cache).object_size = object_size;
            (*cache).bitmap_length = bitmap_size;
            (*cache).slab_order = slab_order;
            (*cache).next_offset = 0;
            (*cache).obj_per_slab = obj_count;
            (*cache).max_alignments = (waste / L1_LINE) as u32 + 1;
            (*cache).ctor = ctor;
            (*cache).dtor = dtor;
            (*cache).extended = Extended::Untouched;
            (*cache).error = None;
            (*cache).lock = KmemLock::new();
            (*cache).next = core::ptr::null_mut();
        }
    }

    /// Grow this cache by exactly one empty slab.
    ///
    /// # Safety
    /// `cache` must point to a live, initialised `Cache`.
    pub(crate) unsafe fn new_slab(cache: *mut Cache, buddy: Buddy) -> bool {
        let colour = unsafe { (*cache).next_offset };
        let slab = unsafe { Slab::alloc(cache, colour, buddy) };
        unsafe {
            (*cache).next_offset = (colour + 1) % (*cache).max_alignments;
        }

        match slab {
            Some(slab) => {
                unsafe { Slab::attach(slab) };
                #[cfg(feature = "log")]
                log::trace!(
                    "cache \"{}\" grew by one slab ({} total)",
                    unsafe { (*cache).name() },
                    unsafe { (*cache).slab_count.iter().sum::<u32>() }
                );
                true
            }
            None => {
                unsafe { (*cache).error = Some(KmemError::CacheExpand) };
                #[cfg(feature = "log")]
                log::warn!("cache \"{}\" failed to grow: buddy layer exhausted", unsafe {
                    (*cache).name()
                });
                false
            }
        }
    }

    /// Allocate one object, growing the cache by a slab first if there are
    /// no partial or empty slabs to serve it from.
    ///
    /// # Safety
    /// `cache` must point to a live, initialised `Cache`.
    pub(crate) unsafe fn alloc_obj(cache: *mut Cache, buddy: Buddy) -> Option<*mut u8> {
        let partial = unsafe { (*cache).heads[SlabState::Partial as usize] };
        if !partial.is_null() {
            return Some(unsafe { Slab::alloc_object(partial) });
        }

        if unsafe { (*cache).heads[SlabState::Empty as usize] }.is_null() {
            if !unsafe { Cache::new_slab(cache, buddy) } {
                unsafe { (*cache).error = Some(KmemError::CacheObjAlloc) };
                return None;
            }
            unsafe {
                if (*cache).extended != Extended::Untouched {
                    (*cache).extended = Extended::Grown;
                }
            }
        }

        let empty = unsafe { (*cache).heads[SlabState::Empty as usize] };
        Some(unsafe { Slab::alloc_object(empty) })
    }

    /// Release `obj` back to whichever of this cache's partial or full
    /// slabs owns it.
    ///
    /// # Safety
    /// `cache` must point to a live, initialised `Cache`.
    pub(crate) unsafe fn free_obj(cache: *mut Cache, obj: *mut u8) -> bool {
        for state in [SlabState::Partial, SlabState::Full] {
            let mut slab = unsafe { (*cache).heads[state as usize] };
            while !slab.is_null() {
                let next = unsafe { (*slab).next() };
                if unsafe { Slab::free_object(slab, obj) } {
                    return true;
                }
                slab = next;
            }
        }
        unsafe { (*cache).error = Some(KmemError::CacheObjFree) };
        false
    }

    /// Reclaim every empty slab, subject to the grown-since-last-shrink
    /// heuristic, and return the number of blocks freed.
    ///
    /// The condition below mixes `&&` and `||` exactly as in the design it
    /// reproduces: reclaim when `extended == Stable` and an empty slab
    /// exists, OR when `extended == Untouched`.
    ///
    /// # Safety
    /// `cache` must point to a live, initialised `Cache`.
    pub(crate) unsafe fn shrink(cache: *mut Cache, buddy: Buddy) -> u64 {
        let mut freed_slabs = 0u64;

        let extended = unsafe { (*cache).extended };
        let empty_exists = !unsafe { (*cache).heads[SlabState::Empty as usize] }.is_null();

        if extended == Extended::Stable && empty_exists || extended == Extended::Untouched {
            let mut slab = unsafe { (*cache).heads[SlabState::Empty as usize] };
            while !slab.is_null() {
                let next = unsafe { (*slab).next() };
                unsafe {
                    Slab::detach(slab);
                    let _ = Slab::free(slab, false, buddy);
                }
                slab = next;
                freed_slabs += 1;
            }
        }

        unsafe { (*cache).extended = Extended::Stable };
        freed_slabs * (1u64 << unsafe { (*cache).slab_order })
    }

    /// Free every slab this cache owns, including live objects (no attempt
    /// is made to tell live slots from never-allocated ones).
    ///
    /// # Safety
    /// `cache` must point to a live, initialised `Cache`; after this call
    /// its slab lists are empty and it must not be used to serve objects
    /// again.
    pub(crate) unsafe fn destroy_slabs(cache: *mut Cache, buddy: Buddy) {
        for state in SlabState::ALL {
            let mut slab = unsafe { (*cache).heads[state as usize] };
            while !slab.is_null() {
                let next = unsafe { (*slab).next() };
                unsafe {
                    Slab::detach(slab);
                    let _ = Slab::free(slab, true, buddy);
                }
                slab = next;
            }
        }
    }

    /// This cache's name, as UTF-8 up to the first NUL byte.
    pub fn name(&self) -> &str {
        let len = self.name.iter().position(|&b| b == 0).unwrap_or(CACHE_NAME_LEN);
        core::str::from_utf8(&self.name[..len]).unwrap_or("")
    }

    /// Occupancy snapshot for `kmem_cache_info`.
    pub fn info(&self) -> CacheSnapshot {
        let total_slabs: u32 = self.slab_count.iter().sum();
        let total_objects = total_slabs * self.obj_per_slab as u32;

        let mut used_objects = 0u32;
        let mut slab = self.heads[SlabState::Partial as usize];
        while !slab.is_null() {
            used_objects += unsafe { (*slab).used_count() };
            slab = unsafe { (*slab).next() };
        }
        used_objects += self.slab_count[SlabState::Full as usize] * self.obj_per_slab as u32;

        let usage_percent = if total_objects != 0 {
            100.0 * used_objects as f64 / total_objects as f64
        } else {
            0.0
        };

        CacheSnapshot {
            object_size: self.object_size,
            slab_order: self.slab_order,
            obj_per_slab: self.obj_per_slab,
            total_slabs,
            used_objects,
            total_objects,
            usage_percent,
        }
    }

    /// Take and clear the last error latched on this cache.
    pub fn error(&mut self) -> Option<KmemError> {
        self.error.take()
    }

    /// The per-cache lock guarding free/shrink/destroy/info.
    pub(crate) fn lock(&self) -> &KmemLock {
        &self.lock
    }

    pub(crate) fn next(&self) -> *mut Cache {
        self.next
    }

    pub(crate) fn set_next(&mut self, next: *mut Cache) {
        self.next = next;
    }

    pub(crate) fn head(&self, state: SlabState) -> *mut Slab {
        self.heads[state as usize]
    }

    pub(crate) fn set_head(&mut self, state: SlabState, slab: *mut Slab) {
        self.heads[state as usize] = slab;
    }

    pub(crate) fn bump_count(&mut self, state: SlabState, delta: i32) {
        let count = &mut self.slab_count[state as usize];
        *count = (*count as i32 + delta) as u32;
    }
}

static_assertions::const_assert!(core::mem::size_of::<Cache>() <= 4096);
