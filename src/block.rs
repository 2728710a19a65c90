//! Block-size arithmetic shared by the buddy and slab layers.
//!
//! Everything here is a pure function: no state, no locking, nothing that
//! touches the backing region. `buddy` and `slab` build their index math on
//! top of these.

/// Size of one block, the buddy layer's atomic unit of allocation.
pub const BLOCK_SIZE: usize = 4096;

/// L1 cache line size, used to colour slab headers across cache sets.
pub const L1_LINE: usize = 64;

/// Highest order the free-list array supports (2^24 blocks ~ 64GB of blocks).
pub const MAX_ORDER_LIMIT: usize = 25;

/// Number of blocks needed to hold `bytes`, rounded up.
#[inline]
pub const fn size_in_blocks(bytes: usize) -> usize {
    bytes.div_ceil(BLOCK_SIZE)
}

/// Byte size of `2^order` blocks.
#[inline]
pub const fn size_of_blocks(order: u32) -> usize {
    (1usize << order) * BLOCK_SIZE
}

/// Number of L1 lines needed to hold `bytes`, rounded up.
#[inline]
pub const fn size_in_l1(bytes: usize) -> usize {
    bytes.div_ceil(L1_LINE)
}

/// Smallest order `k` such that `2^k` blocks cover `bytes`.
///
/// Special-cased to `0` for anything that fits in a single block, matching
/// the allocator's convention that order 0 always means "one block".
pub fn order_for(bytes: usize) -> u32 {
    if bytes <= BLOCK_SIZE {
        return 0;
    }
    let blocks = size_in_blocks(bytes);
    let mut order = 1u32;
    while (1usize << order) < blocks {
        order += 1;
    }
    order
}

/// Position of the highest set bit in `n`, or `None` if `n == 0`.
pub fn highest_bit(n: u64) -> Option<u32> {
    if n == 0 { None } else { Some(63 - n.leading_zeros()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_for_fits_one_block() {
        assert_eq!(order_for(1), 0);
        assert_eq!(order_for(BLOCK_SIZE), 0);
    }

    #[test]
    fn order_for_rounds_up_to_next_power_of_two_blocks() {
        assert_eq!(order_for(BLOCK_SIZE + 1), 1);
        assert_eq!(order_for(2 * BLOCK_SIZE), 1);
        assert_eq!(order_for(2 * BLOCK_SIZE + 1), 2);
        assert_eq!(order_for(4 * BLOCK_SIZE), 2);
    }

    #[test]
    fn highest_bit_sentinel_and_values() {
        assert_eq!(highest_bit(0), None);
        assert_eq!(highest_bit(1), Some(0));
        assert_eq!(highest_bit(63), Some(5));
        assert_eq!(highest_bit(64), Some(6));
    }
}
