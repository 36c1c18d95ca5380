//! Chooses the number of radix bits and partitioning passes.
//!
//! Partitions are sized so that one partition of R fits into a fraction of
//! the L2 cache, and a single pass is used as long as its histogram still
//! fits into L1.
use crate::buffer::CACHE_LINE_SIZE;
use crate::row::Row;

pub const L2_CACHE_SIZE: usize = 1280 * 1024;
pub const L2_CACHE_TUPLES: usize = L2_CACHE_SIZE / size_of::<Row>();
/// Share of L2 one R partition may occupy.
pub const CACHE_DIVISOR: usize = 4;
/// 32 KiB of L1 holding 4-byte counters.
pub const MAX_SINGLE_PASS_BITS: u32 = 15 - 2;
/// Rows of padding between partitions in the second pass.
pub const SMALL_PADDING_TUPLES: usize = 3 * CACHE_LINE_SIZE / size_of::<Row>();

/// The partitioning layout every worker of one join shares.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RadixPlan {
    pub radix_bits: u32,
    pub num_passes: u32,
}

impl RadixPlan {
    /// Sizes the partitioning for a join of `num_r` and `num_s` rows.
    ///
    /// With `explicit_bits` the size heuristic is skipped, but the fan-out is
    /// still raised to at least `nthreads`.
    pub fn new(
        num_r: usize,
        num_s: usize,
        nthreads: usize,
        explicit_bits: Option<u32>,
        force_two_passes: bool,
    ) -> Self {
        let radix_bits = match explicit_bits {
            Some(bits) => bits.max(bits_for(nthreads)),
            None => calc_num_radix_bits(num_r, num_s, nthreads),
        };
        let num_passes = if force_two_passes {
            2
        } else {
            calc_num_passes(radix_bits)
        };
        Self {
            radix_bits,
            num_passes,
        }
    }

    /// Bits consumed by the first pass; also the shift of the second.
    #[inline]
    pub fn bits_pass_1(&self) -> u32 {
        self.radix_bits / self.num_passes
    }

    #[inline]
    pub fn bits_pass_2(&self) -> u32 {
        self.radix_bits - self.bits_pass_1()
    }

    #[inline]
    pub fn fanout_pass_1(&self) -> usize {
        1 << self.bits_pass_1()
    }

    #[inline]
    pub fn fanout_pass_2(&self) -> usize {
        1 << self.bits_pass_2()
    }

    #[inline]
    pub fn fanout(&self) -> usize {
        1 << self.radix_bits
    }

    /// Padding after each first-pass partition, large enough to hold the
    /// second pass's padding too.
    #[inline]
    pub fn padding_tuples(&self) -> usize {
        SMALL_PADDING_TUPLES * (self.fanout_pass_2() + 1)
    }

    /// Extra rows a partition buffer needs on top of the relation itself.
    #[inline]
    pub fn relation_padding(&self) -> usize {
        self.padding_tuples() * self.fanout_pass_1()
    }

    pub fn part_queue_capacity(&self) -> usize {
        (self.fanout_pass_1() * 2).next_power_of_two()
    }

    pub fn join_queue_capacity(&self) -> usize {
        1 << (self.radix_bits + 1)
    }
}

/// Smallest `b` with `1 << b >= n`.
fn bits_for(n: usize) -> u32 {
    n.max(1).next_power_of_two().trailing_zeros()
}

pub fn calc_num_radix_bits(num_r: usize, _num_s: usize, nthreads: usize) -> u32 {
    let max_tuples_in_cache = L2_CACHE_TUPLES / CACHE_DIVISOR;
    let required = num_r.div_ceil(max_tuples_in_cache).max(nthreads);
    bits_for(required)
}

pub fn calc_num_passes(radix_bits: u32) -> u32 {
    if radix_bits <= MAX_SINGLE_PASS_BITS { 1 } else { 2 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants() {
        assert_eq!(SMALL_PADDING_TUPLES, 24);
        assert_eq!(L2_CACHE_TUPLES, 163_840);
    }

    #[test]
    fn small_relations_get_one_partition_per_thread() {
        assert_eq!(calc_num_radix_bits(0, 0, 1), 0);
        assert_eq!(calc_num_radix_bits(1000, 2000, 4), 2);
        assert_eq!(calc_num_radix_bits(1000, 2000, 5), 3);
    }

    #[test]
    fn bits_follow_relation_size() {
        // 40_960 tuples fit one partition.
        assert_eq!(calc_num_radix_bits(40_960, 0, 1), 0);
        assert_eq!(calc_num_radix_bits(40_961, 0, 1), 1);
        // 2^27 tuples -> 3277 partitions -> 12 bits.
        assert_eq!(calc_num_radix_bits(1 << 27, 0, 2), 12);
    }

    #[test]
    fn passes_switch_after_l1_limit() {
        assert_eq!(calc_num_passes(0), 1);
        assert_eq!(calc_num_passes(13), 1);
        assert_eq!(calc_num_passes(14), 2);
    }

    #[test]
    fn explicit_bits_respect_thread_count() {
        let plan = RadixPlan::new(1_000_000, 1_000_000, 8, Some(1), false);
        assert_eq!(plan.radix_bits, 3);
        let plan = RadixPlan::new(1_000_000, 1_000_000, 4, Some(4), false);
        assert_eq!(plan.radix_bits, 4);
        assert_eq!(plan.num_passes, 1);
    }

    #[test]
    fn two_pass_fanouts() {
        let plan = RadixPlan::new(0, 0, 1, Some(15), false);
        assert_eq!(plan.num_passes, 2);
        assert_eq!(plan.bits_pass_1(), 7);
        assert_eq!(plan.bits_pass_2(), 8);
        assert_eq!(plan.fanout_pass_1() * plan.fanout_pass_2(), plan.fanout());
        assert_eq!(plan.padding_tuples(), 24 * 257);
    }

    #[test]
    fn single_pass_padding() {
        let plan = RadixPlan::new(0, 0, 1, Some(4), false);
        assert_eq!(plan.fanout_pass_1(), 16);
        assert_eq!(plan.fanout_pass_2(), 1);
        assert_eq!(plan.padding_tuples(), 48);
        assert_eq!(plan.relation_padding(), 48 * 16);
        assert_eq!(plan.join_queue_capacity(), 32);
    }

    #[test]
    fn forced_two_passes() {
        let plan = RadixPlan::new(0, 0, 2, Some(1), true);
        assert_eq!(plan.num_passes, 2);
        assert_eq!(plan.fanout_pass_1(), 1);
        assert_eq!(plan.fanout_pass_2(), 2);
    }
}
