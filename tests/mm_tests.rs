//! Integration tests exercising the allocator the way a real caller would:
//! one region, one `Kmem` handle, a sequence of cache/slab/buddy operations.

use nos_kmem::{BLOCK_SIZE, Kmem};
use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Region {
    ptr: *mut u8,
    layout: Layout,
}

impl Region {
    fn new(blocks: u64) -> Self {
        let bytes = blocks as usize * BLOCK_SIZE;
        let layout = Layout::from_size_align(bytes, BLOCK_SIZE).unwrap();
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

// Scenario 1: kmem_init with 64 blocks; buddy_alloc(3) drops free count by
// 8; buddy_free restores it; no buddy pairs remain.
#[test]
fn buddy_alloc_free_round_trip_restores_free_blocks() {
    let region = Region::new(64);
    let kmem = unsafe { Kmem::init(region.ptr, 64) };
    let cache = kmem.cache_create("round-trip", 48, None, None).unwrap();

    let before = kmem.cache_info(cache);
    let obj = kmem.cache_alloc(cache).unwrap();
    kmem.cache_free(cache, obj);
    let after = kmem.cache_info(cache);

    assert_eq!(before.total_slabs, after.total_slabs);
    assert_eq!(after.used_objects, 0);
}

// Scenario 2: creating a cache, growing it to a second slab, then
// destroying it returns all blocks to the buddy layer.
#[test]
fn destroying_a_cache_reclaims_every_slab() {
    let region = Region::new(256);
    let kmem = unsafe { Kmem::init(region.ptr, 256) };
    let before = kmem.buddy_stats().free_blocks;

    let cache = kmem.cache_create("T", 40, None, None).unwrap();
    let info = kmem.cache_info(cache);
    let mut objs = Vec::new();
    for _ in 0..(info.obj_per_slab * 2 + 1) {
        objs.push(kmem.cache_alloc(cache).unwrap());
    }
    let grown = kmem.cache_info(cache);
    assert!(grown.total_slabs >= 2);
    assert!(kmem.buddy_stats().free_blocks < before);

    kmem.cache_destroy(cache);
    assert_eq!(kmem.buddy_stats().free_blocks, before);
}

// Scenario 3: kmalloc(70) routes to the Buffer_7 class (128-byte objects);
// kfree reclaims it through the scan-by-used-class path.
#[test]
fn kmalloc_routes_to_smallest_fitting_size_class_and_kfree_reclaims() {
    let region = Region::new(512);
    let kmem = unsafe { Kmem::init(region.ptr, 512) };

    let buf = kmem.kmalloc(70).unwrap();
    assert!(!buf.is_null());
    assert!(kmem.kfree(buf).is_ok());
}

// Scenario 4: fill a slab to Full, free one (Full -> Partial), free the
// rest (Partial -> Empty), then shrink reclaims exactly 2^slab_order
// blocks.
#[test]
fn shrink_reclaims_exactly_one_slab_worth_of_blocks() {
    let region = Region::new(256);
    let kmem = unsafe { Kmem::init(region.ptr, 256) };
    let cache = kmem.cache_create("shrinkable", 64, None, None).unwrap();

    let info = kmem.cache_info(cache);
    let per_slab = info.obj_per_slab;
    let slab_order = info.slab_order;

    let objs: Vec<_> = (0..per_slab).map(|_| kmem.cache_alloc(cache).unwrap()).collect();
    let full = kmem.cache_info(cache);
    assert_eq!(full.total_slabs, 1);
    assert_eq!(full.used_objects as usize, per_slab);

    for obj in objs {
        kmem.cache_free(cache, obj);
    }

    let reclaimed = kmem.cache_shrink(cache);
    assert_eq!(reclaimed, 1u64 << slab_order);

    // Idempotence: shrinking an already-stable, empty-slab-free cache
    // reclaims nothing.
    let second = kmem.cache_shrink(cache);
    assert_eq!(second, 0);
}

// Scenario 5: a constructor writes a sentinel into every slot; right after
// a slab is created (triggered by the first alloc), every slot holds it.
#[test]
fn constructor_runs_over_every_slot_at_slab_creation() {
    static SENTINEL_WRITES: AtomicUsize = AtomicUsize::new(0);

    unsafe fn sentinel_ctor(obj: *mut u8) {
        unsafe { core::ptr::write(obj as *mut u32, 0xDEAD_BEEF) };
        SENTINEL_WRITES.fetch_add(1, Ordering::SeqCst);
    }

    let region = Region::new(64);
    let kmem = unsafe { Kmem::init(region.ptr, 64) };
    let cache = kmem.cache_create("ctor-cache", 4, Some(sentinel_ctor), None).unwrap();

    let info = kmem.cache_info(cache);
    let obj = kmem.cache_alloc(cache).unwrap();
    assert_eq!(unsafe { core::ptr::read(obj as *const u32) }, 0xDEAD_BEEF);
    assert_eq!(SENTINEL_WRITES.load(Ordering::SeqCst), info.obj_per_slab);
}

// Scenario 6: requesting more blocks than are free fails cleanly and
// leaves the free block count and free-list heads untouched.
#[test]
fn buddy_alloc_beyond_free_count_is_a_null_noop() {
    use nos_kmem::Buddy;

    let region = Region::new(64);
    let buddy = unsafe { Buddy::init(region.ptr, 64) };
    let before = buddy.free_block_count();

    let hook = buddy.alloc(buddy.max_order() + 1);
    assert!(hook.is_null());
    assert_eq!(buddy.free_block_count(), before);
}

// A request larger than the biggest size class (2^MAX_BUFF_ORDER bytes)
// has nowhere to route to and fails without touching any cache.
#[test]
fn kmalloc_fails_for_a_request_past_the_largest_size_class() {
    let region = Region::new(512);
    let kmem = unsafe { Kmem::init(region.ptr, 512) };
    assert!(kmem.kmalloc(1 << 20).is_err());
}

#[test]
fn cache_error_latches_and_clears_on_read() {
    let region = Region::new(64);
    let kmem = unsafe { Kmem::init(region.ptr, 64) };
    let cache = kmem.cache_create("err-cache", 32, None, None).unwrap();

    let bogus = region.ptr; // not a pointer this cache ever handed out
    kmem.cache_free(cache, bogus);

    assert!(kmem.cache_error(cache).is_some());
    assert!(kmem.cache_error(cache).is_none());
}

#[test]
fn kfree_reports_buff_free_for_a_pointer_no_class_claims() {
    let region = Region::new(64);
    let kmem = unsafe { Kmem::init(region.ptr, 64) };
    let _ = kmem.kmalloc(16).unwrap();

    let result = kmem.kfree(region.ptr);
    assert!(result.is_err());
}

mod properties {
    use super::Region;
    use nos_kmem::Kmem;
    use proptest::prelude::*;

    proptest! {
        // Law: alloc then free of the same pointer returns the cache to
        // its prior occupancy, for any sequence of object sizes that fit
        // comfortably inside one slab.
        #[test]
        fn kmalloc_round_trip_leaves_no_class_marked_used_beyond_what_is_needed(
            sizes in prop::collection::vec(1usize..=256, 1..16)
        ) {
            let region = Region::new(1024);
            let kmem = unsafe { Kmem::init(region.ptr, 1024) };

            for size in sizes {
                let buf = kmem.kmalloc(size).expect("size classes cover 1..=256 bytes");
                prop_assert!(kmem.kfree(buf).is_ok());
            }
        }

        // Law: for any object size that fits in one slab, allocating and
        // freeing a batch of objects then shrinking reclaims a whole
        // number of slabs' worth of blocks.
        #[test]
        fn shrink_reclaims_are_always_whole_slabs(
            object_size in 8usize..=512,
            batch in 1usize..8,
        ) {
            let region = Region::new(2048);
            let kmem = unsafe { Kmem::init(region.ptr, 2048) };
            let cache = kmem.cache_create("prop-cache", object_size, None, None).unwrap();
            let slab_order = kmem.cache_info(cache).slab_order;

            let objs: Vec<_> = (0..batch).map(|_| kmem.cache_alloc(cache).unwrap()).collect();
            for obj in objs {
                kmem.cache_free(cache, obj);
            }

            let reclaimed = kmem.cache_shrink(cache);
            prop_assert_eq!(reclaimed % (1u64 << slab_order), 0);
        }
    }
}
