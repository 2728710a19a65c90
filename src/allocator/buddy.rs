//! Buddy allocator.
//!
//! Owns the backing region after [`Buddy::init`] and hands out runs of
//! `2^order` blocks. Free runs are threaded into intrusive, singly-linked
//! free lists whose nodes live inside the free memory itself (the first
//! eight bytes of a free block hold the index of the next free run at the
//! same order, `0` meaning "end of list") - this is the same trick the
//! C original used, generalised from raw pointers to block indices so the
//! encoding stays valid no matter where the region is mapped.
//!
//! The control state (free-list heads, counts, the scratch bump cursor)
//! lives inside block 0 of the region rather than in this struct - `Buddy`
//! itself is just a handle (a base pointer) threaded through every call,
//! replacing the C original's module-global `mem_space`/`buddy_ctrl_struct`
//! pair per the single-instance note in the design docs.
//!
//! No method here takes a lock: callers that share a `Buddy` across threads
//! (see `facade.rs`) wrap every call in their own `buddy_lock`, the same way
//! the C original's `block_alloc`/`mem_free` wrappers held `buddy_sem`
//! around `buddy_alloc`/`buddy_free`.

use core::ptr::null_mut;

use crate::block::{L1_LINE, MAX_ORDER_LIMIT, size_in_l1, size_of_blocks};
use crate::error::{KmemError, Result};

/// Index reserved to mean "no block" (block 0 is never handed out; it holds
/// the control structure and scratch area).
const NULL_INDEX: u64 = 0;

/// Working allocation starts at block 1, right after the control block.
const FIRST_ALLOC_INDEX: u64 = 1;

/// Control state embedded inside block 0 of the region.
#[repr(C)]
struct BuddyControl {
    alloc_block_count: u64,
    free_block_count: u64,
    free_heads: [u64; MAX_ORDER_LIMIT],
    max_order: u32,
    ctrl_offset: u64,
}

static_assertions::const_assert!(core::mem::size_of::<BuddyControl>() <= crate::block::BLOCK_SIZE);

/// A `{addr, order}` pair returned by `alloc` and consumed by `free`.
///
/// `addr` is null when an allocation failed; `order` is always meaningful so
/// a failed hook can still be inspected for diagnostics.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHook {
    /// Base address of the run, or null on allocation failure.
    pub addr: *mut u8,
    /// Order of the run (`2^order` blocks).
    pub order: u32,
}

impl BlockHook {
    /// A null hook at the given order, used to report allocation failure.
    pub const fn failed(order: u32) -> Self {
        Self { addr: null_mut(), order }
    }

    /// Whether this hook refers to a real allocation.
    pub fn is_null(&self) -> bool {
        self.addr.is_null()
    }
}

/// Snapshot of buddy-layer occupancy, handed to an external presenter.
#[derive(Debug, Clone, Copy)]
pub struct BuddyStats {
    /// Total blocks available for allocation (region size minus block 0).
    pub total_blocks: u64,
    /// Blocks currently free.
    pub free_blocks: u64,
    /// Highest order the free-list array can hold a run of.
    pub max_order: u32,
}

/// Handle to a buddy-managed region.
///
/// Cheap to copy: it is nothing more than the region's base address. All
/// actual state lives inside block 0 of the region.
#[derive(Clone, Copy)]
pub struct Buddy {
    base: *mut u8,
}

impl Buddy {
    /// Carve up `block_count` blocks starting at `base` and initialise the
    /// free lists.
    ///
    /// Block 0 is reserved for the control structure and the scratch bump
    /// allocator (see [`Buddy::ctrl_alloc`]); the remaining `block_count - 1`
    /// blocks become the working area managed by `alloc`/`free`.
    ///
    /// # Safety
    /// - `base` must point to at least `block_count * BLOCK_SIZE` bytes of
    ///   valid, exclusively-owned, `BLOCK_SIZE`-aligned memory.
    /// - The memory must stay valid and untouched by anything else for as
    ///   long as the returned handle (or any copy of it) is in use.
    pub unsafe fn init(base: *mut u8, block_count: u64) -> Self {
        let buddy = Self { base };
        let working = block_count.saturating_sub(1);
        let max_order = crate::block::highest_bit(working).unwrap_or(0);

        let ctrl = unsafe { buddy.ctrl_mut() };
        ctrl.alloc_block_count = working;
        ctrl.free_block_count = working;
        ctrl.max_order = max_order;
        ctrl.ctrl_offset = (size_in_l1(core::mem::size_of::<BuddyControl>()) * L1_LINE) as u64;
        for head in ctrl.free_heads.iter_mut() {
            *head = NULL_INDEX;
        }

        let mut order = max_order;
        let mut cursor = FIRST_ALLOC_INDEX;
        loop {
            if working & (1u64 << order) != 0 {
                ctrl.free_heads[order as usize] = cursor;
                buddy.null_next_index(cursor);
                cursor += 1u64 << order;
            } else {
                ctrl.free_heads[order as usize] = NULL_INDEX;
            }
            if order == 0 {
                break;
            }
            order -= 1;
        }

        buddy
    }

    /// Allocate a run of `2^order` blocks.
    ///
    /// Returns a hook with a null address if there is no run large enough,
    /// or if `order` exceeds `max_order`. No partial runs are ever returned.
    pub fn alloc(&self, order: u32) -> BlockHook {
        let ctrl = unsafe { self.ctrl_mut() };
        let block_count = 1u64 << order;

        if order > ctrl.max_order || ctrl.free_block_count < block_count {
            return BlockHook::failed(order);
        }

        let head = ctrl.free_heads[order as usize];
        let index = if head != NULL_INDEX {
            self.remove(head, order).expect("free-list head is always removable")
        } else {
            let mut temp_order = order;
            while temp_order <= ctrl.max_order && ctrl.free_heads[temp_order as usize] == NULL_INDEX
            {
                temp_order += 1;
            }
            debug_assert!(
                temp_order <= ctrl.max_order,
                "free_block_count said a run exists but no free list holds one"
            );

            let head = ctrl.free_heads[temp_order as usize];
            let mut index =
                self.remove(head, temp_order).expect("free-list head is always removable");

            while temp_order != order {
                let buddy_index = index + (1u64 << (temp_order - 1));
                self.put_first(buddy_index, temp_order - 1);
                temp_order -= 1;
            }
            index
        };

        ctrl.free_block_count -= block_count;
        BlockHook { addr: self.block_ptr(index), order }
    }

    /// Return a run to the free lists, coalescing with its buddy (and its
    /// buddy's buddy, and so on) as far as possible.
    ///
    /// Rejects hooks whose index is out of range for this region.
    pub fn free(&self, hook: BlockHook) -> Result<()> {
        let ctrl = unsafe { self.ctrl_mut() };
        let mut index = self.index_of(hook.addr);
        let mut order = hook.order;
        let block_count = 1u64 << order;

        if index == NULL_INDEX || index > ctrl.alloc_block_count {
            return Err(KmemError::Free);
        }

        let mut buddy = self.calc_buddy_index(index, order).and_then(|b| self.remove(b, order));
        while let Some(b) = buddy {
            if b < index {
                index = b;
            }
            order += 1;
            buddy = self.calc_buddy_index(index, order).and_then(|b| self.remove(b, order));
        }

        self.put_first(index, order);
        ctrl.free_block_count += block_count;
        Ok(())
    }

    /// Bump-allocate `bytes` from the scratch area inside block 0, rounded
    /// up to a whole number of L1 lines. Used only during `kmem_init` to
    /// carve out the allocator's own control structures; returns `None` once
    /// the cursor would leave block 0.
    pub fn ctrl_alloc(&self, bytes: usize) -> Option<*mut u8> {
        let ctrl = unsafe { self.ctrl_mut() };
        if ctrl.ctrl_offset as usize >= crate::block::BLOCK_SIZE {
            return None;
        }
        let ptr = unsafe { self.base.add(ctrl.ctrl_offset as usize) };
        ctrl.ctrl_offset += (size_in_l1(bytes) * L1_LINE) as u64;
        Some(ptr)
    }

    /// Current occupancy snapshot.
    pub fn stats(&self) -> BuddyStats {
        let ctrl = unsafe { self.ctrl() };
        BuddyStats {
            total_blocks: ctrl.alloc_block_count,
            free_blocks: ctrl.free_block_count,
            max_order: ctrl.max_order,
        }
    }

    /// Blocks currently free, a convenience accessor used by invariant
    /// checks and by the facade's `kmalloc` size-class routing.
    pub fn free_block_count(&self) -> u64 {
        unsafe { self.ctrl() }.free_block_count
    }

    /// Highest order this region's free-list array can represent.
    pub fn max_order(&self) -> u32 {
        unsafe { self.ctrl() }.max_order
    }

    // -- internal plumbing -------------------------------------------------

    unsafe fn ctrl(&self) -> &BuddyControl {
        unsafe { &*(self.base as *const BuddyControl) }
    }

    #[allow(clippy::mut_from_ref)]
    unsafe fn ctrl_mut(&self) -> &mut BuddyControl {
        unsafe { &mut *(self.base as *mut BuddyControl) }
    }

    fn block_ptr(&self, index: u64) -> *mut u8 {
        unsafe { self.base.add((index as usize) * crate::block::BLOCK_SIZE) }
    }

    fn index_of(&self, ptr: *mut u8) -> u64 {
        (unsafe { ptr.offset_from(self.base) }) as u64 / crate::block::BLOCK_SIZE as u64
    }

    fn get_next_index(&self, index: u64) -> u64 {
        unsafe { (self.block_ptr(index) as *const u64).read_unaligned() }
    }

    fn set_next_index(&self, index: u64, next: u64) {
        unsafe { (self.block_ptr(index) as *mut u64).write_unaligned(next) };
    }

    fn null_next_index(&self, index: u64) {
        self.set_next_index(index, NULL_INDEX);
    }

    /// Index of the buddy of a run at `index`/`order`, per the pairing rule
    /// anchored at block 1: only indices with `(i mod 2^k) == 1` (or `k ==
    /// 0`) have a buddy at all.
    fn calc_buddy_index(&self, index: u64, order: u32) -> Option<u64> {
        if order != 0 && index % (1u64 << order) != 1 {
            return None;
        }
        let left = index % (1u64 << (order + 1)) == 1;
        Some(if left { index + (1u64 << order) } else { index - (1u64 << order) })
    }

    fn put_first(&self, index: u64, order: u32) {
        let ctrl = unsafe { self.ctrl_mut() };
        let head = ctrl.free_heads[order as usize];
        self.set_next_index(index, head);
        ctrl.free_heads[order as usize] = index;
    }

    /// Unlink `index` from order `order`'s free list, if it is on it.
    fn remove(&self, index: u64, order: u32) -> Option<u64> {
        let ctrl = unsafe { self.ctrl_mut() };
        if index == NULL_INDEX || index > ctrl.alloc_block_count || order > ctrl.max_order {
            return None;
        }

        let mut cur = ctrl.free_heads[order as usize];
        let mut prev = NULL_INDEX;
        if cur == NULL_INDEX {
            return None;
        }

        while cur != index {
            prev = cur;
            cur = self.get_next_index(cur);
            if cur == NULL_INDEX {
                return None;
            }
        }

        let next = self.get_next_index(cur);
        if prev != NULL_INDEX {
            self.set_next_index(prev, next);
        } else {
            ctrl.free_heads[order as usize] = next;
        }
        self.null_next_index(cur);
        Some(cur)
    }
}

// SAFETY: `Buddy` is a bare handle over a caller-owned region; every
// operation is synchronized externally by the facade's `buddy_lock`.
unsafe impl Send for Buddy {}
unsafe impl Sync for Buddy {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::alloc::{Layout, alloc_zeroed, dealloc};
    use std::vec::Vec;

    struct Region {
        ptr: *mut u8,
        layout: Layout,
    }

    impl Region {
        fn new(blocks: u64) -> Self {
            let bytes = blocks as usize * crate::block::BLOCK_SIZE;
            let layout = Layout::from_size_align(bytes, crate::block::BLOCK_SIZE).unwrap();
            let ptr = unsafe { alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }
    }

    impl Drop for Region {
        fn drop(&mut self) {
            unsafe { dealloc(self.ptr, self.layout) };
        }
    }

    fn free_heads_snapshot(buddy: &Buddy) -> Vec<u64> {
        (0..=buddy.max_order())
            .map(|o| unsafe { buddy.ctrl() }.free_heads[o as usize])
            .collect()
    }

    // Scenario 1: kmem_init-equivalent with 64 blocks.
    #[test]
    fn alloc_then_free_restores_free_count_and_coalesces() {
        let region = Region::new(64);
        let buddy = unsafe { Buddy::init(region.ptr, 64) };
        assert_eq!(buddy.free_block_count(), 63);

        let hook = buddy.alloc(3);
        assert!(!hook.is_null());
        assert_eq!(buddy.free_block_count(), 63 - 8);

        buddy.free(hook).unwrap();
        assert_eq!(buddy.free_block_count(), 63);

        // No buddy pairs should remain: every order-k free list should have
        // at most one run (otherwise two buddies of the same order would
        // have been left uncoalesced).
        let ctrl = unsafe { buddy.ctrl() };
        for order in 0..=ctrl.max_order {
            let head = ctrl.free_heads[order as usize];
            if head == NULL_INDEX {
                continue;
            }
            let next = buddy.get_next_index(head);
            assert_eq!(next, NULL_INDEX, "order {order} has more than one free run");
        }
    }

    // Scenario 6: requesting more than is free fails cleanly.
    #[test]
    fn alloc_beyond_free_count_is_a_null_noop() {
        let region = Region::new(64);
        let buddy = unsafe { Buddy::init(region.ptr, 64) };
        let before = buddy.free_block_count();
        let heads_before = free_heads_snapshot(&buddy);

        let hook = buddy.alloc(buddy.max_order() + 1);
        assert!(hook.is_null());
        assert_eq!(buddy.free_block_count(), before);
        assert_eq!(heads_before, free_heads_snapshot(&buddy));
    }

    #[test]
    fn buddy_monotonicity_single_outstanding_allocation() {
        let region = Region::new(16);
        let buddy = unsafe { Buddy::init(region.ptr, 16) };
        let snapshot = free_heads_snapshot(&buddy);

        let hook = buddy.alloc(2);
        buddy.free(hook).unwrap();

        assert_eq!(snapshot, free_heads_snapshot(&buddy));
    }

    #[test]
    fn free_rejects_out_of_range_hook() {
        let region = Region::new(16);
        let buddy = unsafe { Buddy::init(region.ptr, 16) };
        let bogus = BlockHook { addr: region.ptr, order: 0 }; // index 0, reserved
        assert_eq!(buddy.free(bogus), Err(KmemError::Free));
    }

    #[test]
    fn ctrl_alloc_bump_fails_once_block_zero_is_exhausted() {
        let region = Region::new(16);
        let buddy = unsafe { Buddy::init(region.ptr, 16) };
        let mut allocations = 0;
        while buddy.ctrl_alloc(L1_LINE).is_some() {
            allocations += 1;
            assert!(allocations < 1000, "scratch allocator should exhaust block 0");
        }
    }

    #[test]
    fn size_of_blocks_matches_order() {
        assert_eq!(size_of_blocks(0), crate::block::BLOCK_SIZE);
        assert_eq!(size_of_blocks(3), 8 * crate::block::BLOCK_SIZE);
    }
}
