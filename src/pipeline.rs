//! The parallel radix join.
//!
//! ```text
//!  start ─► R pass 1 ─► S pass 1 ─► tasks ─► [pass 2] ─► join ─► done
//!       (barrier between every phase; pass 2 only with two passes)
//! ```
//!
//! Every worker takes part in every phase. Thread 0 turns the first pass
//! into tasks; with two passes they go through the partition queue and the
//! second pass feeds the join queue, otherwise they go straight to the join
//! queue.
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::barrier::Barrier;
use crate::buffer::{PartitionBuffer, RowSpan, SharedRows};
use crate::error::{Error, Result};
use crate::join::JoinConfig;
use crate::kernel::JoinKernel;
use crate::output::{
    ChunkedTable, Discard, Materialized, OutputList, OutputShape, ThreadOutput,
};
use crate::partition::{HistogramBoard, ParallelPartition, split_task};
use crate::planner::RadixPlan;
use crate::queue::{LockFreeQueue, MutexQueue, QueueKind, Task, TaskQueue};
use crate::row::Row;

/// Phase timings of one worker, or the per-field maximum over all of them.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RadixTimers {
    pub total: Duration,
    /// Both partitioning passes.
    pub partition: Duration,
    pub pass_1: Duration,
    /// The whole first pass over R: histogram, offsets and scatter.
    pub partition_r: Duration,
    /// The whole first pass over S. Together with `partition_r` this is `pass_1`.
    pub partition_s: Duration,
    pub pass_2: Duration,
    pub join: Duration,
    /// Summed over all tasks, inside the kernel.
    pub build: Duration,
    pub probe: Duration,
}

impl RadixTimers {
    pub fn max(self, other: Self) -> Self {
        Self {
            total: self.total.max(other.total),
            partition: self.partition.max(other.partition),
            pass_1: self.pass_1.max(other.pass_1),
            partition_r: self.partition_r.max(other.partition_r),
            partition_s: self.partition_s.max(other.partition_s),
            pass_2: self.pass_2.max(other.pass_2),
            join: self.join.max(other.join),
            build: self.build.max(other.build),
            probe: self.probe.max(other.probe),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ThreadStats {
    pub thread_id: usize,
    pub matches: u64,
    /// Second-pass tasks this worker split.
    pub parts_partitioned: usize,
    pub parts_joined: usize,
    pub timers: RadixTimers,
}

/// Logs `err` and terminates the process. Used where returning would leave
/// sibling workers parked at a barrier forever.
pub(crate) fn fatal(err: Error) -> ! {
    error!(%err, "radix join aborted");
    std::process::exit(1)
}

/// Spawns worker `tid`. Failing to start thread 0 is reported; any later
/// failure is fatal because the earlier workers already wait at a barrier.
pub(crate) fn spawn_worker<'scope, 'env, T, F>(
    scope: &'scope Scope<'scope, 'env>,
    tid: usize,
    f: F,
) -> Result<ScopedJoinHandle<'scope, T>>
where
    F: FnOnce() -> T + Send + 'scope,
    T: Send + 'scope,
{
    match thread::Builder::new()
        .name(format!("radix-{tid}"))
        .spawn_scoped(scope, f)
    {
        Ok(handle) => Ok(handle),
        Err(err) if tid == 0 => Err(Error::ThreadSpawn(err)),
        Err(err) => fatal(Error::ThreadSpawn(err)),
    }
}

fn push_or_die<'a, Q: TaskQueue<Task<'a>>>(queue: &Q, task: Task<'a>) {
    if queue.push(task).is_err() {
        fatal(Error::QueueFull {
            capacity: queue.capacity(),
        });
    }
}

/// Where a worker puts its matches.
enum ThreadSink {
    Discard,
    List(OutputList),
    Chunked(ChunkedTable),
}

impl ThreadSink {
    fn new(config: &JoinConfig, num_s: usize) -> Self {
        if !config.materialize {
            return ThreadSink::Discard;
        }
        match config.output {
            OutputShape::LinkedList => ThreadSink::List(OutputList::new()),
            OutputShape::Chunked { prealloc: false } => ThreadSink::Chunked(ChunkedTable::new()),
            OutputShape::Chunked { prealloc: true } => ThreadSink::Chunked(
                ChunkedTable::with_chunks(ChunkedTable::prealloc_chunks_per_thread(
                    num_s,
                    config.nthreads,
                )),
            ),
        }
    }

    fn join(
        &mut self,
        kernel: JoinKernel,
        task: &Task<'_>,
        radix_bits: u32,
        timers: &mut RadixTimers,
    ) -> u64 {
        match self {
            ThreadSink::Discard => kernel.join(task, radix_bits, &mut Discard, false, timers),
            ThreadSink::List(list) => kernel.join(task, radix_bits, list, true, timers),
            ThreadSink::Chunked(table) => kernel.join(task, radix_bits, table, true, timers),
        }
    }
}

struct WorkerOutput {
    stats: ThreadStats,
    sink: ThreadSink,
}

/// State every worker of one join shares.
struct Shared<'a, Q> {
    rel_r: &'a [Row],
    rel_s: &'a [Row],
    tmp_r: SharedRows<'a>,
    tmp_s: SharedRows<'a>,
    /// Second-pass and histogram-kernel scratch, same layout as `tmp_*`.
    tmp_r2: Option<SharedRows<'a>>,
    tmp_s2: Option<SharedRows<'a>>,
    plan: RadixPlan,
    kernel: JoinKernel,
    config: &'a JoinConfig,
    board: HistogramBoard,
    barrier: Barrier,
    part_queue: Q,
    join_queue: Q,
}

impl<'a, Q: TaskQueue<Task<'a>>> Shared<'a, Q> {
    fn partition_pass(&self, rel: &'a [Row], dst: SharedRows<'a>, tid: usize) -> Option<Vec<usize>> {
        ParallelPartition {
            rel,
            dst,
            shift: 0,
            bits: self.plan.bits_pass_1(),
            padding: self.plan.padding_tuples(),
            algorithm: self.config.partition,
        }
        .run(tid, &self.board, &self.barrier)
    }

    /// Turns first-pass partition pairs into tasks. Runs on thread 0 only.
    fn create_tasks(&self, out_r: &[usize], out_s: &[usize]) {
        let padding = self.plan.padding_tuples();
        let queue = if self.plan.num_passes == 2 {
            &self.part_queue
        } else {
            &self.join_queue
        };
        let scratch = |buf: Option<SharedRows<'a>>, offset: usize, len: usize| {
            buf.map_or_else(RowSpan::empty, |b| b.span(offset, len + padding))
        };

        for i in 0..self.plan.fanout_pass_1() {
            let ntup_r = out_r[i + 1] - out_r[i] - padding;
            let ntup_s = out_s[i + 1] - out_s[i] - padding;
            if ntup_r > 0 && ntup_s > 0 {
                push_or_die(
                    queue,
                    Task {
                        r: self.tmp_r.span(out_r[i], ntup_r),
                        tmp_r: scratch(self.tmp_r2, out_r[i], ntup_r),
                        s: self.tmp_s.span(out_s[i], ntup_s),
                        tmp_s: scratch(self.tmp_s2, out_s[i], ntup_s),
                    },
                );
            }
        }
    }

    fn worker(&self, tid: usize) -> WorkerOutput {
        let mut stats = ThreadStats {
            thread_id: tid,
            ..Default::default()
        };
        let mut sink = ThreadSink::new(self.config, self.rel_s.len());
        let mut timers = RadixTimers::default();

        self.barrier.wait();
        let start = Instant::now();

        let out_r = self.partition_pass(self.rel_r, self.tmp_r, tid);
        let r_done = Instant::now();
        timers.partition_r = r_done - start;

        let out_s = self.partition_pass(self.rel_s, self.tmp_s, tid);
        let pass_1_done = Instant::now();
        timers.partition_s = pass_1_done - r_done;
        timers.pass_1 = pass_1_done - start;

        if let (Some(out_r), Some(out_s)) = (&out_r, &out_s) {
            self.create_tasks(out_r, out_s);
        }
        self.barrier.wait_with(|| {
            debug!(
                part_tasks = self.part_queue.len(),
                join_tasks = self.join_queue.len(),
                "first pass done"
            );
            true
        });

        let pass_2_start = Instant::now();
        if self.plan.num_passes == 2 {
            let shift = self.plan.bits_pass_1();
            let bits = self.plan.bits_pass_2();
            while let Some(task) = self.part_queue.pop() {
                split_task(&task, shift, bits, |t| push_or_die(&self.join_queue, t));
                stats.parts_partitioned += 1;
            }
            self.barrier.wait_with(|| {
                debug!(join_tasks = self.join_queue.len(), "second pass done");
                true
            });
        }
        let join_start = Instant::now();
        timers.pass_2 = join_start - pass_2_start;
        timers.partition = join_start - start;

        while let Some(task) = self.join_queue.pop() {
            stats.matches += sink.join(self.kernel, &task, self.plan.radix_bits, &mut timers);
            stats.parts_joined += 1;
        }
        let join_done = Instant::now();
        timers.join = join_done - join_start;

        self.barrier.wait();
        timers.total = start.elapsed();
        stats.timers = timers;

        if let ThreadSink::Chunked(table) = &mut sink {
            table.finish();
        }
        debug!(
            tid,
            matches = stats.matches,
            parts_partitioned = stats.parts_partitioned,
            parts_joined = stats.parts_joined,
            "worker done"
        );
        WorkerOutput { stats, sink }
    }
}

/// Starts the workers over already allocated buffers and waits for them.
fn drive<'a, Q: TaskQueue<Task<'a>>>(
    rel_r: &'a [Row],
    rel_s: &'a [Row],
    tmp: [SharedRows<'a>; 2],
    scratch: [Option<SharedRows<'a>>; 2],
    plan: RadixPlan,
    kernel: JoinKernel,
    config: &'a JoinConfig,
) -> Result<Vec<WorkerOutput>> {
    let [tmp_r, tmp_s] = tmp;
    let [tmp_r2, tmp_s2] = scratch;
    let shared = Shared::<Q> {
        rel_r,
        rel_s,
        tmp_r,
        tmp_s,
        tmp_r2,
        tmp_s2,
        plan,
        kernel,
        config,
        board: HistogramBoard::new(config.nthreads, plan.fanout_pass_1()),
        barrier: Barrier::new(config.nthreads),
        part_queue: Q::with_capacity(plan.part_queue_capacity()),
        join_queue: Q::with_capacity(plan.join_queue_capacity()),
    };

    thread::scope(|s| -> Result<Vec<WorkerOutput>> {
        let mut handles = Vec::with_capacity(config.nthreads);
        for tid in 0..config.nthreads {
            let shared = &shared;
            handles.push(spawn_worker(s, tid, move || shared.worker(tid))?);
        }
        Ok(handles
            .into_iter()
            .map(|h| h.join().unwrap_or_else(|e| std::panic::resume_unwind(e)))
            .collect())
    })
}

/// Runs the radix join on `nthreads` fresh workers and collects their
/// statistics and output.
pub(crate) fn run_radix(
    rel_r: &[Row],
    rel_s: &[Row],
    plan: RadixPlan,
    kernel: JoinKernel,
    config: &JoinConfig,
) -> Result<(Vec<ThreadStats>, Materialized)> {
    let fill = if config.prefault {
        Row::FILL
    } else {
        Row::default()
    };
    let padding = plan.relation_padding();
    let mut tmp_r = PartitionBuffer::allocate(rel_r.len() + padding, fill, "tmpRelR")?;
    let mut tmp_s = PartitionBuffer::allocate(rel_s.len() + padding, fill, "tmpRelS")?;
    let (mut tmp_r2, mut tmp_s2) = if plan.num_passes == 2 || kernel.needs_scratch() {
        (
            Some(PartitionBuffer::allocate(rel_r.len() + padding, fill, "tmpRelR2")?),
            Some(PartitionBuffer::allocate(rel_s.len() + padding, fill, "tmpRelS2")?),
        )
    } else {
        (None, None)
    };

    let tmp = [tmp_r.shared(), tmp_s.shared()];
    let scratch = [
        tmp_r2.as_mut().map(PartitionBuffer::shared),
        tmp_s2.as_mut().map(PartitionBuffer::shared),
    ];
    let outputs = match config.queue {
        QueueKind::LockFree => {
            drive::<LockFreeQueue<_>>(rel_r, rel_s, tmp, scratch, plan, kernel, config)?
        }
        QueueKind::Mutex => {
            drive::<MutexQueue<_>>(rel_r, rel_s, tmp, scratch, plan, kernel, config)?
        }
    };

    let mut stats = Vec::with_capacity(outputs.len());
    let mut lists = Vec::new();
    let mut tables = Vec::new();
    for WorkerOutput { stats: st, sink } in outputs {
        match sink {
            ThreadSink::Discard => {}
            ThreadSink::List(list) => lists.push(ThreadOutput {
                thread_id: st.thread_id,
                matches: st.matches,
                list,
            }),
            ThreadSink::Chunked(table) => tables.push(table),
        }
        stats.push(st);
    }

    let output = match (config.materialize, config.output) {
        (false, _) => Materialized::None,
        (true, OutputShape::LinkedList) => Materialized::LinkedLists(lists),
        (true, OutputShape::Chunked { .. }) => {
            Materialized::Chunked(ChunkedTable::concatenate(tables))
        }
    };
    Ok((stats, output))
}
