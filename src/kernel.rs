//! In-cache join kernels run once per co-partitioned task.
use std::time::Instant;

use crate::output::OutputSink;
use crate::pipeline::RadixTimers;
use crate::queue::Task;
use crate::row::{Key, Row};

/// Join strategy for a single partition pair.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum JoinKernel {
    /// `bucket[]`/`next[]` chained hash table over R.
    BucketChaining,
    /// R reordered by an in-cache histogram; probes scan one bucket range.
    Histogram,
}

impl JoinKernel {
    /// Whether tasks must carry an R scratch span at least as long as R.
    pub fn needs_scratch(self) -> bool {
        matches!(self, JoinKernel::Histogram)
    }

    /// Joins one task. `radix_bits` is the number of low key bits already
    /// consumed by partitioning.
    pub fn join<S: OutputSink>(
        self,
        task: &Task<'_>,
        radix_bits: u32,
        sink: &mut S,
        materialize: bool,
        timers: &mut RadixTimers,
    ) -> u64 {
        // The worker that popped the task is the only one touching its spans.
        let (r, s) = unsafe { (task.r.as_slice(), task.s.as_slice()) };
        match self {
            JoinKernel::BucketChaining => {
                bucket_chaining_join(r, s, radix_bits, sink, materialize, timers)
            }
            JoinKernel::Histogram => {
                let scratch = unsafe { task.tmp_r.as_mut_slice() };
                histogram_join(r, scratch, s, radix_bits, sink, materialize, timers)
            }
        }
    }
}

#[inline(always)]
fn bucket_of(key: Key, radix_bits: u32, mask: usize) -> usize {
    (key >> radix_bits) as usize & mask
}

#[cfg(feature = "nightly")]
#[inline(always)]
fn prefetch<T>(ptr: *const T) {
    unsafe { std::intrinsics::prefetch_read_data::<T, 3>(ptr) };
}

#[cfg(not(feature = "nightly"))]
#[inline(always)]
fn prefetch<T>(_ptr: *const T) {}

/// Distance, in S rows, of the bucket prefetch ahead of the probe.
const PREFETCH_DISTANCE: usize = 16;

/// Bucket-chaining join.
///
/// Matches come out in S order, and for one S row in reverse build order
/// (most recently inserted R row first).
pub fn bucket_chaining_join<S: OutputSink>(
    r: &[Row],
    s: &[Row],
    radix_bits: u32,
    sink: &mut S,
    materialize: bool,
    timers: &mut RadixTimers,
) -> u64 {
    let start = Instant::now();
    let n = r.len().next_power_of_two();
    let mask = n - 1;
    // 1-based row indices, 0 ends a chain.
    let mut next = vec![0u32; r.len()];
    let mut bucket = vec![0u32; n];

    for (i, row) in r.iter().enumerate() {
        let idx = bucket_of(row.key, radix_bits, mask);
        next[i] = bucket[idx];
        bucket[idx] = i as u32 + 1;
    }
    let built = Instant::now();
    timers.build += built - start;

    let mut matches = 0u64;
    for (i, srow) in s.iter().enumerate() {
        if let Some(ahead) = s.get(i + PREFETCH_DISTANCE) {
            prefetch(&bucket[bucket_of(ahead.key, radix_bits, mask)]);
        }
        let mut hit = bucket[bucket_of(srow.key, radix_bits, mask)] as usize;
        if materialize {
            while hit > 0 {
                let rrow = &r[hit - 1];
                if rrow.key == srow.key {
                    matches += 1;
                    sink.insert(srow.key, rrow.payload, srow.payload);
                }
                hit = next[hit - 1] as usize;
            }
        } else {
            while hit > 0 {
                if r[hit - 1].key == srow.key {
                    matches += 1;
                }
                hit = next[hit - 1] as usize;
            }
        }
    }
    timers.probe += built.elapsed();

    matches
}

/// Buckets of the histogram kernel for `num_r` build rows.
pub fn histogram_buckets(num_r: usize) -> usize {
    (num_r.next_power_of_two() >> 2).max(4)
}

/// Histogram join. `scratch` receives R reordered by bucket and must hold at
/// least `r.len()` rows.
pub fn histogram_join<S: OutputSink>(
    r: &[Row],
    scratch: &mut [Row],
    s: &[Row],
    radix_bits: u32,
    sink: &mut S,
    materialize: bool,
    timers: &mut RadixTimers,
) -> u64 {
    let start = Instant::now();
    let n = histogram_buckets(r.len());
    let mask = n - 1;

    // bounds[b]..bounds[b + 1] is bucket b in the reordered R.
    let mut bounds = vec![0usize; n + 1];
    for row in r {
        bounds[bucket_of(row.key, radix_bits, mask) + 1] += 1;
    }
    for i in 1..=n {
        bounds[i] += bounds[i - 1];
    }
    let mut cursor = bounds.clone();
    for row in r {
        let idx = bucket_of(row.key, radix_bits, mask);
        scratch[cursor[idx]] = *row;
        cursor[idx] += 1;
    }
    let sorted = &scratch[..r.len()];
    let built = Instant::now();
    timers.build += built - start;

    let mut matches = 0u64;
    for srow in s {
        let idx = bucket_of(srow.key, radix_bits, mask);
        let bucket = &sorted[bounds[idx]..bounds[idx + 1]];
        for rrow in bucket {
            if rrow.key == srow.key {
                matches += 1;
                if materialize {
                    sink.insert(srow.key, rrow.payload, srow.payload);
                }
            }
        }
    }
    timers.probe += built.elapsed();

    matches
}

#[cfg(test)]
mod tests {
    use rand::prelude::*;
    use rand_chacha::ChaCha8Rng;

    use super::*;
    use crate::output::{Discard, OutputList};

    fn random_rows(n: usize, max_key: u32, seed: u64) -> Vec<Row> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        (0..n)
            .map(|i| Row::new(rng.random_range(0..max_key), i as u32))
            .collect()
    }

    fn nested_loop(r: &[Row], s: &[Row]) -> u64 {
        s.iter()
            .map(|srow| r.iter().filter(|rrow| rrow.key == srow.key).count() as u64)
            .sum()
    }

    #[test]
    fn chain_order_is_most_recent_first() {
        let r = [Row::new(3, 10), Row::new(3, 11), Row::new(7, 12), Row::new(3, 13)];
        let s = [Row::new(3, 100), Row::new(7, 101)];
        let mut out = OutputList::new();
        let mut timers = RadixTimers::default();
        let matches = bucket_chaining_join(&r, &s, 0, &mut out, true, &mut timers);
        assert_eq!(matches, 4);

        // The list is newest first; reverse to emission order.
        let mut emitted: Vec<_> = out.iter().map(|t| (t.s_payload, t.r_payload)).collect();
        emitted.reverse();
        assert_eq!(emitted, vec![(100, 13), (100, 11), (100, 10), (101, 12)]);
    }

    #[test]
    fn kernels_agree() {
        for (nr, ns, max_key, bits) in [(1000, 3000, 500, 0), (4096, 4096, 1 << 20, 4), (37, 90, 10, 2)] {
            let r = random_rows(nr, max_key, 1);
            let s = random_rows(ns, max_key, 2);
            let expected = nested_loop(&r, &s);
            let mut timers = RadixTimers::default();

            let bc = bucket_chaining_join(&r, &s, bits, &mut Discard, false, &mut timers);
            let mut scratch = vec![Row::default(); r.len()];
            let ht = histogram_join(&r, &mut scratch, &s, bits, &mut Discard, false, &mut timers);
            assert_eq!(bc, expected);
            assert_eq!(ht, expected);
        }
    }

    #[test]
    fn materialized_output_matches_count() {
        let r: Vec<Row> = (0..100).map(|k| Row::new(k, k + 1000)).collect();
        let s: Vec<Row> = (0..300).map(|i| Row::new(i % 150, i)).collect();
        let mut timers = RadixTimers::default();

        for kernel in [JoinKernel::BucketChaining, JoinKernel::Histogram] {
            let mut out = OutputList::new();
            let matches = match kernel {
                JoinKernel::BucketChaining => {
                    bucket_chaining_join(&r, &s, 0, &mut out, true, &mut timers)
                }
                JoinKernel::Histogram => {
                    let mut scratch = vec![Row::default(); r.len()];
                    histogram_join(&r, &mut scratch, &s, 0, &mut out, true, &mut timers)
                }
            };
            assert_eq!(matches, 200);
            assert_eq!(out.len(), 200);
            assert!(out.iter().all(|t| t.r_payload == t.key + 1000 && t.key < 100));
        }
    }

    #[test]
    fn empty_build_side() {
        let s = random_rows(100, 10, 3);
        let mut timers = RadixTimers::default();
        assert_eq!(bucket_chaining_join(&[], &s, 3, &mut Discard, true, &mut timers), 0);
        assert_eq!(histogram_join(&[], &mut [], &s, 3, &mut Discard, true, &mut timers), 0);
    }

    #[test]
    fn histogram_bucket_count() {
        assert_eq!(histogram_buckets(0), 4);
        assert_eq!(histogram_buckets(16), 4);
        assert_eq!(histogram_buckets(100), 32);
    }
}
