//! Radix partitioning.
//!
//! The first pass runs on all workers at once. Each worker histograms its own
//! slice of the relation, publishes the histogram on a [`HistogramBoard`],
//! and after a barrier derives where its rows go from everyone's histograms:
//!
//! ```text
//!  dst[j] = sum_{i <  tid} hist_i[j]      (rows of partition <= j before us)
//!         + sum_{i >= tid} hist_i[j - 1]  (rows of partition <  j after us)
//!         + j * padding
//! ```
//!
//! with `hist_i` holding inclusive prefix sums. The second pass is serial and
//! runs inside one task.
use std::ops::Range;
use std::thread;

use parking_lot::RwLock;

use crate::barrier::Barrier;
use crate::buffer::{CacheLine, PartitionBuffer, ROWS_PER_CACHE_LINE, SharedRows};
use crate::error::{Error, Result};
use crate::planner::SMALL_PADDING_TUPLES;
use crate::queue::Task;
use crate::row::{Key, Row};

/// Scatter strategy of the parallel pass.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum PartitionAlgorithm {
    #[default]
    Scalar,
    /// Software write-combining: stage one cache line per partition and
    /// write whole lines.
    WriteCombining,
}

#[inline(always)]
pub fn radix_of(key: Key, shift: u32, mask: u32) -> usize {
    ((key >> shift) & mask) as usize
}

/// Rows `tid` scans out of `n`; the last thread also takes the remainder.
pub fn thread_slice(n: usize, nthreads: usize, tid: usize) -> Range<usize> {
    let per_thread = n / nthreads;
    let start = tid * per_thread;
    let end = if tid == nthreads - 1 {
        n
    } else {
        start + per_thread
    };
    start..end
}

/// One histogram slot per worker.
///
/// A worker only writes its own slot before the post-histogram barrier and
/// everyone only reads after it, so the locks never contend.
pub struct HistogramBoard {
    slots: Vec<RwLock<Vec<u32>>>,
}

impl HistogramBoard {
    pub fn new(nthreads: usize, fanout: usize) -> Self {
        Self {
            slots: (0..nthreads).map(|_| RwLock::new(vec![0; fanout])).collect(),
        }
    }

    pub fn threads(&self) -> usize {
        self.slots.len()
    }

    /// Counts `rows` into slot `tid` and turns the counts into an inclusive
    /// prefix sum.
    fn publish(&self, tid: usize, rows: &[Row], shift: u32, fanout: usize) {
        let mask = (fanout - 1) as u32;
        let mut hist = self.slots[tid].write();
        hist.clear();
        hist.resize(fanout, 0);
        for row in rows {
            hist[radix_of(row.key, shift, mask)] += 1;
        }
        for j in 1..fanout {
            hist[j] += hist[j - 1];
        }
    }

    /// Write offsets of thread `tid` for every partition.
    fn offsets(&self, tid: usize, fanout: usize, padding: usize) -> Vec<usize> {
        let mut dst = vec![0usize; fanout];
        for (i, slot) in self.slots.iter().enumerate() {
            let hist = slot.read();
            if i < tid {
                for j in 0..fanout {
                    dst[j] += hist[j] as usize;
                }
            } else {
                for j in 1..fanout {
                    dst[j] += hist[j - 1] as usize;
                }
            }
        }
        for (j, d) in dst.iter_mut().enumerate() {
            *d += j * padding;
        }
        dst
    }
}

/// One parallel partitioning pass over a whole relation.
pub(crate) struct ParallelPartition<'a> {
    pub rel: &'a [Row],
    pub dst: SharedRows<'a>,
    pub shift: u32,
    pub bits: u32,
    pub padding: usize,
    pub algorithm: PartitionAlgorithm,
}

impl ParallelPartition<'_> {
    /// Runs the pass for worker `tid`. Every worker of `barrier` must call
    /// this with the same pass.
    ///
    /// Thread 0 gets back the start of every partition plus a terminating
    /// entry, so partition `j` holds `out[j + 1] - out[j] - padding` rows.
    pub(crate) fn run(
        &self,
        tid: usize,
        board: &HistogramBoard,
        barrier: &Barrier,
    ) -> Option<Vec<usize>> {
        let nthreads = barrier.threads();
        debug_assert_eq!(board.threads(), nthreads);
        let fanout = 1usize << self.bits;
        let slice = &self.rel[thread_slice(self.rel.len(), nthreads, tid)];

        board.publish(tid, slice, self.shift, fanout);
        barrier.wait();

        let dst = board.offsets(tid, fanout, self.padding);
        let out = (tid == 0).then(|| {
            let mut out = dst.clone();
            out.push(self.rel.len() + fanout * self.padding);
            out
        });

        match self.algorithm {
            PartitionAlgorithm::Scalar => self.scatter_scalar(slice, dst),
            PartitionAlgorithm::WriteCombining => self.scatter_swwc(slice, dst),
        }
        barrier.wait();

        out
    }

    fn scatter_scalar(&self, slice: &[Row], mut dst: Vec<usize>) {
        let mask = ((1usize << self.bits) - 1) as u32;
        let base = self.dst.as_ptr();
        for row in slice {
            let idx = radix_of(row.key, self.shift, mask);
            debug_assert!(dst[idx] < self.dst.len());
            // Offsets of different threads never overlap.
            unsafe { base.add(dst[idx]).write(*row) };
            dst[idx] += 1;
        }
    }

    fn scatter_swwc(&self, slice: &[Row], mut pos: Vec<usize>) {
        let fanout = 1usize << self.bits;
        let mask = (fanout - 1) as u32;
        let base = self.dst.as_ptr();
        // Our first slot per partition; anything below belongs to a
        // neighbour or to padding.
        let first = pos.clone();
        let mut staged = vec![CacheLine::splat(Row::default()); fanout];

        for row in slice {
            let idx = radix_of(row.key, self.shift, mask);
            let p = pos[idx];
            staged[idx].0[p % ROWS_PER_CACHE_LINE] = *row;
            pos[idx] = p + 1;
            if (p + 1) % ROWS_PER_CACHE_LINE == 0 {
                let line_start = p + 1 - ROWS_PER_CACHE_LINE;
                unsafe { flush_line(base, &staged[idx], line_start, first[idx], p + 1) };
            }
        }

        for idx in 0..fanout {
            let end = pos[idx];
            let line_start = end - end % ROWS_PER_CACHE_LINE;
            if end > line_start.max(first[idx]) {
                unsafe { flush_line(base, &staged[idx], line_start, first[idx], end) };
            }
        }

        #[cfg(target_arch = "x86_64")]
        unsafe {
            std::arch::x86_64::_mm_sfence()
        };
    }
}

/// Writes the staged rows `[max(line_start, first), end)` of one line.
///
/// # Safety
/// The range must be inside the destination and owned by the caller.
#[inline]
unsafe fn flush_line(base: *mut Row, line: &CacheLine, line_start: usize, first: usize, end: usize) {
    let from = line_start.max(first);
    let dst = unsafe { base.add(from) };

    #[cfg(target_arch = "x86_64")]
    {
        let full = from == line_start && end - line_start == ROWS_PER_CACHE_LINE;
        if full && dst as usize % align_of::<CacheLine>() == 0 {
            unsafe { stream_line(dst as *mut CacheLine, line) };
            return;
        }
    }

    let src = &line.0[from - line_start..end - line_start];
    unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), dst, src.len()) };
}

/// Non-temporal store of one full cache line.
#[cfg(target_arch = "x86_64")]
#[inline]
unsafe fn stream_line(dst: *mut CacheLine, line: &CacheLine) {
    use std::arch::x86_64::{__m128i, _mm_loadu_si128, _mm_stream_si128};

    let src = line as *const CacheLine as *const __m128i;
    let dst = dst as *mut __m128i;
    for i in 0..4 {
        unsafe { _mm_stream_si128(dst.add(i), _mm_loadu_si128(src.add(i))) };
    }
}

/// Serial radix partitioning of `src` into `dst` with
/// [`SMALL_PADDING_TUPLES`] between partitions.
///
/// Returns the start of every partition and the row counts.
pub(crate) fn radix_cluster(
    src: &[Row],
    dst: &mut [Row],
    shift: u32,
    bits: u32,
) -> (Vec<usize>, Vec<usize>) {
    let fanout = 1usize << bits;
    let mask = (fanout - 1) as u32;
    let mut counts = vec![0usize; fanout];
    for row in src {
        counts[radix_of(row.key, shift, mask)] += 1;
    }

    let mut starts = Vec::with_capacity(fanout);
    let mut offset = 0;
    for (i, c) in counts.iter().enumerate() {
        starts.push(offset + i * SMALL_PADDING_TUPLES);
        offset += c;
    }

    let mut pos = starts.clone();
    for row in src {
        let idx = radix_of(row.key, shift, mask);
        dst[pos[idx]] = *row;
        pos[idx] += 1;
    }
    (starts, counts)
}

/// Second pass over one first-pass task. Emits a join task for every
/// sub-partition non-empty on both sides.
///
/// The sub-partitions land in the task's scratch spans, and the source spans
/// they were read from become the new tasks' scratch.
pub(crate) fn split_task<'a>(
    task: &Task<'a>,
    shift: u32,
    bits: u32,
    mut emit: impl FnMut(Task<'a>),
) {
    // The worker that popped the task owns all four spans.
    let (starts_r, counts_r) = unsafe {
        radix_cluster(task.r.as_slice(), task.tmp_r.as_mut_slice(), shift, bits)
    };
    let (starts_s, counts_s) = unsafe {
        radix_cluster(task.s.as_slice(), task.tmp_s.as_mut_slice(), shift, bits)
    };

    // Source and scratch spans share their layout, so widening the source to
    // the scratch length stays inside its first-pass partition.
    let (old_r, old_s) = unsafe {
        (
            task.r.with_len(task.tmp_r.len()),
            task.s.with_len(task.tmp_s.len()),
        )
    };

    for i in 0..(1usize << bits) {
        if counts_r[i] > 0 && counts_s[i] > 0 {
            emit(Task {
                r: task.tmp_r.sub(starts_r[i], counts_r[i]),
                tmp_r: old_r.sub(starts_r[i], counts_r[i]),
                s: task.tmp_s.sub(starts_s[i], counts_s[i]),
                tmp_s: old_s.sub(starts_s[i], counts_s[i]),
            });
        }
    }
}

/// A relation after one parallel partitioning pass.
pub struct PartitionedRelation {
    buffer: PartitionBuffer,
    offsets: Vec<usize>,
    padding: usize,
}

impl PartitionedRelation {
    pub fn fanout(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn buffer(&self) -> &PartitionBuffer {
        &self.buffer
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    pub fn count(&self, i: usize) -> usize {
        self.offsets[i + 1] - self.offsets[i] - self.padding
    }

    pub fn bounds(&self, i: usize) -> Range<usize> {
        self.offsets[i]..self.offsets[i] + self.count(i)
    }

    /// Rows of partition `i`, padding excluded.
    pub fn partition(&self, i: usize) -> &[Row] {
        &self.buffer.as_slice()[self.bounds(i)]
    }

    pub fn histogram(&self) -> Vec<usize> {
        (0..self.fanout()).map(|i| self.count(i)).collect()
    }

    pub fn partitions(&self) -> impl Iterator<Item = &[Row]> + '_ {
        (0..self.fanout()).map(|i| self.partition(i))
    }
}

/// Partitions `rel` on `bits` bits starting at `shift` with `nthreads`
/// workers. Padding slots keep [`Row::FILL`].
pub fn partition_relation(
    rel: &[Row],
    nthreads: usize,
    shift: u32,
    bits: u32,
    padding: usize,
    algorithm: PartitionAlgorithm,
) -> Result<PartitionedRelation> {
    if nthreads == 0 {
        return Err(Error::InvalidConfig("nthreads must be at least 1".into()));
    }
    let fanout = 1usize << bits;
    let mut buffer =
        PartitionBuffer::allocate(rel.len() + fanout * padding, Row::FILL, "partition buffer")?;
    let board = HistogramBoard::new(nthreads, fanout);
    let barrier = Barrier::new(nthreads);

    let offsets = {
        let pass = ParallelPartition {
            rel,
            dst: buffer.shared(),
            shift,
            bits,
            padding,
            algorithm,
        };
        thread::scope(|s| -> Result<Vec<usize>> {
            let mut handles = Vec::with_capacity(nthreads);
            for tid in 0..nthreads {
                let (pass, board, barrier) = (&pass, &board, &barrier);
                let handle = crate::pipeline::spawn_worker(s, tid, move || {
                    pass.run(tid, board, barrier)
                })?;
                handles.push(handle);
            }
            let mut offsets = None;
            for h in handles {
                if let Some(out) = h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)) {
                    offsets = Some(out);
                }
            }
            Ok(offsets.unwrap_or_default())
        })?
    };

    Ok(PartitionedRelation {
        buffer,
        offsets,
        padding,
    })
}
