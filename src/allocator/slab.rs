//! Slab layer.
//!
//! A slab is one buddy-allocated run of blocks, reinterpreted in place as a
//! header followed by a bitmap and an object array - the header lives
//! inside the run it describes, the same way a `BlockHook`'s free-list node
//! lives inside the free block it links. Nothing here allocates from a
//! heap: a slab's backing comes from `Buddy::alloc`, and everything above
//! that (header, bitmap, objects) is raw pointer arithmetic over that run.
//!
//! Slab placement is coloured: a slab starts `(cursor mod max_alignments) *
//! L1_LINE` bytes into its run, so that headers for consecutively created
//! slabs land in different L1 sets rather than all aliasing the same one.

use core::ptr;

use crate::allocator::buddy::{BlockHook, Buddy};
use crate::allocator::cache::Cache;
use crate::block::{BLOCK_SIZE, L1_LINE, order_for};
use crate::error::Result;

/// Number of bits in one bitmap entry.
const BITMAP_ENTRY_BITS: usize = 8;
const BITMAP_FULL: u8 = 0xff;

/// A slab's place in its owning cache's occupancy state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum SlabState {
    /// No objects allocated.
    Empty = 0,
    /// Some, but not all, objects allocated.
    Partial = 1,
    /// Every object allocated.
    Full = 2,
}

impl SlabState {
    pub(crate) const ALL: [SlabState; 3] = [SlabState::Empty, SlabState::Partial, SlabState::Full];
}

/// Slab header, embedded at the coloured offset inside its backing run.
///
/// Bitmap and object array immediately follow the header in memory; there
/// is no indirection through a heap allocation anywhere in this layout.
#[repr(C)]
pub struct Slab {
    cache: *mut Cache,
    state: SlabState,
    hook: BlockHook,
    used_count: u32,
    bitmap: *mut u8,
    objects: *mut u8,
    /// Next slab on the owning cache's `state` list.
    next: *mut Slab,
}

impl Slab {
    /// Order such that a run of `2^order` blocks holds a header, a bitmap
    /// byte, and at least one object of `obj_size` bytes.
    pub fn calc_slab_order(obj_size: usize) -> u32 {
        order_for(core::mem::size_of::<Slab>() + obj_size + 1)
    }

    /// Allocate a run from `buddy` at `cache`'s slab order and lay out a new
    /// slab inside it, colouring its header by `colour_index`.
    ///
    /// Runs every configured constructor over all `obj_per_slab` slots
    /// before returning; a slot never changes object identity between here
    /// and its first `alloc_object`.
    ///
    /// # Safety
    /// `cache` must point to a live, fully initialised `Cache`.
    pub unsafe fn alloc(cache: *mut Cache, colour_index: u32, buddy: Buddy) -> Option<*mut Slab> {
        let cache_ref = unsafe { &*cache };
        let hook = buddy.alloc(cache_ref.slab_order);
        if hook.is_null() {
            return None;
        }

        let offset = (colour_index % cache_ref.max_alignments) as usize * L1_LINE;
        let slab_ptr = unsafe { hook.addr.add(offset) } as *mut Slab;
        let bitmap = unsafe { (slab_ptr as *mut u8).add(core::mem::size_of::<Slab>()) };
        let objects = unsafe { bitmap.add(cache_ref.bitmap_length) };

        unsafe {
            ptr::write(
                slab_ptr,
                Slab {
                    cache,
                    state: SlabState::Empty,
                    hook,
                    used_count: 0,
                    bitmap,
                    objects,
                    next: ptr::null_mut(),
                },
            );
            ptr::write_bytes(bitmap, 0, cache_ref.bitmap_length);
        }

        if let Some(ctor) = cache_ref.ctor {
            for i in 0..cache_ref.obj_per_slab {
                unsafe { ctor(objects.add(i * cache_ref.object_size)) };
            }
        }

        Some(slab_ptr)
    }

    /// Free a slab's backing run. The slab must already be detached from
    /// its cache's lists. Runs the destructor over every slot when
    /// `call_dtor` is set, live or not - destruction does not distinguish
    /// allocated slots from never-touched ones.
    ///
    /// # Safety
    /// `slab` must point to a detached, otherwise-unreferenced slab.
    pub unsafe fn free(slab: *mut Slab, call_dtor: bool, buddy: Buddy) -> Result<()> {
        let slab_ref = unsafe { &*slab };
        let cache_ref = unsafe { &*slab_ref.cache };

        if call_dtor {
            if let Some(dtor) = cache_ref.dtor {
                for i in 0..cache_ref.obj_per_slab {
                    unsafe { dtor(slab_ref.objects.add(i * cache_ref.object_size)) };
                }
            }
        }

        buddy.free(slab_ref.hook)
    }

    /// Prepend `slab` to its owning cache's list for `slab.state`.
    ///
    /// # Safety
    /// `slab` must not already be linked into any list.
    pub unsafe fn attach(slab: *mut Slab) {
        let slab_ref = unsafe { &mut *slab };
        let cache_ref = unsafe { &mut *slab_ref.cache };
        let state = slab_ref.state;

        slab_ref.next = cache_ref.head(state);
        cache_ref.set_head(state, slab);
        cache_ref.bump_count(state, 1);
    }

    /// Unlink `slab` from its owning cache's list for its current state.
    ///
    /// Returns `false` if `slab` was not found on that list, which signals
    /// a list/state invariant violation in the caller.
    ///
    /// # Safety
    /// `slab` must point to a live slab.
    pub unsafe fn detach(slab: *mut Slab) -> bool {
        let slab_ref = unsafe { &mut *slab };
        let cache_ref = unsafe { &mut *slab_ref.cache };
        let state = slab_ref.state;

        let mut cur = cache_ref.head(state);
        let mut prev: *mut Slab = ptr::null_mut();
        if cur.is_null() {
            return false;
        }

        while cur != slab {
            prev = cur;
            cur = unsafe { (*cur).next };
            if cur.is_null() {
                return false;
            }
        }

        let next = slab_ref.next;
        if !prev.is_null() {
            unsafe { (*prev).next = next };
        } else {
            cache_ref.set_head(state, next);
        }

        cache_ref.bump_count(state, -1);
        true
    }

    /// Move `slab` to `new_type`, relinking it on the destination list.
    ///
    /// A no-op (returning `false`) if `slab` is already in `new_type`, or if
    /// it could not be found on its current list.
    ///
    /// # Safety
    /// `slab` must point to a live slab.
    pub unsafe fn change_type(slab: *mut Slab, new_type: SlabState) -> bool {
        let slab_ref = unsafe { &mut *slab };
        if slab_ref.state == new_type || !unsafe { Slab::detach(slab) } {
            return false;
        }
        slab_ref.state = new_type;
        unsafe { Slab::attach(slab) };
        true
    }

    /// Claim the first free slot, transitioning state as needed, and return
    /// a pointer to it.
    ///
    /// # Safety
    /// `slab` must point to a slab known not to be full.
    pub unsafe fn alloc_object(slab: *mut Slab) -> *mut u8 {
        let slab_ref = unsafe { &mut *slab };
        let cache_ref = unsafe { &*slab_ref.cache };
        let bitmap =
            unsafe { core::slice::from_raw_parts_mut(slab_ref.bitmap, cache_ref.bitmap_length) };

        let mut obj_index = 0usize;
        'scan: for (i, byte) in bitmap.iter().enumerate() {
            if *byte != BITMAP_FULL {
                let mut j = 0u32;
                while byte & (1 << j) != 0 {
                    j += 1;
                }
                obj_index = i * BITMAP_ENTRY_BITS + j as usize;
                break 'scan;
            }
        }

        bitmap[obj_index / BITMAP_ENTRY_BITS] |= 1 << (obj_index % BITMAP_ENTRY_BITS);
        slab_ref.used_count += 1;

        if slab_ref.used_count < cache_ref.obj_per_slab as u32 && slab_ref.state != SlabState::Partial
        {
            unsafe { Slab::change_type(slab, SlabState::Partial) };
        } else if slab_ref.used_count == cache_ref.obj_per_slab as u32 {
            unsafe { Slab::change_type(slab, SlabState::Full) };
        }

        unsafe { slab_ref.objects.add(obj_index * cache_ref.object_size) }
    }

    /// Release `obj` back to `slab`, transitioning state as needed.
    ///
    /// Rejects pointers outside this slab's object range. The upper bound
    /// used for that check is the address of the *last slot's first byte*,
    /// not its last byte - a faithful reproduction of the original range
    /// check, including its narrow treatment of the final slot.
    ///
    /// # Safety
    /// `slab` must point to a live slab.
    pub unsafe fn free_object(slab: *mut Slab, obj: *mut u8) -> bool {
        let slab_ref = unsafe { &mut *slab };
        let cache_ref = unsafe { &*slab_ref.cache };

        let start_addr = slab_ref.objects;
        let end_addr =
            unsafe { start_addr.add((cache_ref.obj_per_slab - 1) * cache_ref.object_size) };

        if !(start_addr <= obj && end_addr >= obj) {
            return false;
        }

        let obj_index = unsafe { obj.offset_from(start_addr) } as usize / cache_ref.object_size;

        let bitmap =
            unsafe { core::slice::from_raw_parts_mut(slab_ref.bitmap, cache_ref.bitmap_length) };
        bitmap[obj_index / BITMAP_ENTRY_BITS] &= !(1 << (obj_index % BITMAP_ENTRY_BITS));
        slab_ref.used_count -= 1;

        if slab_ref.used_count == 0 {
            unsafe { Slab::change_type(slab, SlabState::Empty) };
        } else if slab_ref.state != SlabState::Partial {
            unsafe { Slab::change_type(slab, SlabState::Partial) };
        }

        true
    }

    /// Number of objects currently allocated from this slab.
    pub fn used_count(&self) -> u32 {
        self.used_count
    }

    /// This slab's position in its owning cache's state machine.
    pub fn state(&self) -> SlabState {
        self.state
    }

    /// Next slab on the same state list, or null at the end.
    pub(crate) fn next(&self) -> *mut Slab {
        self.next
    }
}

static_assertions::const_assert!(core::mem::size_of::<Slab>() < BLOCK_SIZE);
