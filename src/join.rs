//! Join entry point: configuration, algorithm lookup and result.
use std::time::Duration;

use tracing::{error, info};

use crate::error::{Error, Result};
use crate::kernel::JoinKernel;
use crate::output::{Materialized, OutputShape};
use crate::partition::PartitionAlgorithm;
use crate::pipeline::{RadixTimers, ThreadStats, run_radix};
use crate::planner::RadixPlan;
use crate::queue::QueueKind;
use crate::row::Table;

/// Knobs of one join call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinConfig {
    pub nthreads: usize,
    /// `None` sizes partitions from the relation and cache sizes.
    pub radix_bits: Option<u32>,
    pub materialize: bool,
    /// NUMA node for allocations. Logged, not used by the radix joins.
    pub alloc_core: i32,
    /// Only meaningful for cracking joins; ignored here.
    pub cracking_threshold: u32,
    pub partition: PartitionAlgorithm,
    pub queue: QueueKind,
    pub output: OutputShape,
    pub force_two_passes: bool,
    /// Fill partition buffers with [`Row::FILL`](crate::Row::FILL) up front.
    pub prefault: bool,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            nthreads: 2,
            radix_bits: None,
            materialize: false,
            alloc_core: -1,
            cracking_threshold: 0,
            partition: PartitionAlgorithm::Scalar,
            queue: QueueKind::LockFree,
            output: OutputShape::default(),
            force_two_passes: false,
            prefault: true,
        }
    }
}

impl JoinConfig {
    pub fn with_nthreads(mut self, nthreads: usize) -> Self {
        self.nthreads = nthreads;
        self
    }

    pub fn with_radix_bits(mut self, radix_bits: Option<u32>) -> Self {
        self.radix_bits = radix_bits;
        self
    }

    pub fn with_materialize(mut self, materialize: bool) -> Self {
        self.materialize = materialize;
        self
    }

    pub fn with_alloc_core(mut self, alloc_core: i32) -> Self {
        self.alloc_core = alloc_core;
        self
    }

    pub fn with_cracking_threshold(mut self, threshold: u32) -> Self {
        self.cracking_threshold = threshold;
        self
    }

    pub fn with_partition(mut self, partition: PartitionAlgorithm) -> Self {
        self.partition = partition;
        self
    }

    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = queue;
        self
    }

    pub fn with_output(mut self, output: OutputShape) -> Self {
        self.output = output;
        self
    }

    pub fn with_force_two_passes(mut self, force: bool) -> Self {
        self.force_two_passes = force;
        self
    }

    pub fn with_prefault(mut self, prefault: bool) -> Self {
        self.prefault = prefault;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.nthreads == 0 {
            return Err(Error::InvalidConfig("nthreads must be at least 1".into()));
        }
        if let Some(bits) = self.radix_bits
            && bits > 24
        {
            return Err(Error::InvalidConfig(format!(
                "radix bits {bits} exceed the supported maximum of 24"
            )));
        }
        Ok(())
    }
}

/// Outcome of one join.
pub struct JoinResult {
    pub total_matches: u64,
    pub nthreads: usize,
    pub per_thread: Vec<ThreadStats>,
    /// Million input rows (R + S) per second of total join time.
    pub throughput: f64,
    /// Per-field maximum over all workers.
    pub timers: RadixTimers,
    pub plan: RadixPlan,
    pub output: Materialized,
}

/// Join algorithms by name.
pub const ALGORITHMS: &[(&str, JoinKernel)] = &[
    ("RHO", JoinKernel::BucketChaining),
    ("RHT", JoinKernel::Histogram),
];

pub fn lookup_algorithm(name: &str) -> Option<JoinKernel> {
    ALGORITHMS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, kernel)| *kernel)
}

fn throughput(rows: usize, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        rows as f64 / secs / 1e6
    } else {
        0.0
    }
}

/// Joins `rel_r` (build side) with `rel_s` (probe side) on key equality.
pub fn run_join(
    rel_r: &Table,
    rel_s: &Table,
    algorithm: &str,
    config: &JoinConfig,
) -> Result<JoinResult> {
    let Some(kernel) = lookup_algorithm(algorithm) else {
        error!(algorithm, "Algorithm not found");
        return Err(Error::UnknownAlgorithm(algorithm.to_string()));
    };
    config.validate()?;

    let plan = RadixPlan::new(
        rel_r.len(),
        rel_s.len(),
        config.nthreads,
        config.radix_bits,
        config.force_two_passes,
    );
    info!(
        algorithm,
        r = rel_r.len(),
        s = rel_s.len(),
        nthreads = config.nthreads,
        radix_bits = plan.radix_bits,
        passes = plan.num_passes,
        alloc_core = config.alloc_core,
        "radix join"
    );

    let (per_thread, output) =
        run_radix(rel_r.as_slice(), rel_s.as_slice(), plan, kernel, config)?;

    let total_matches = per_thread.iter().map(|t| t.matches).sum();
    let timers = per_thread
        .iter()
        .fold(RadixTimers::default(), |acc, t| acc.max(t.timers));
    let throughput = throughput(rel_r.len() + rel_s.len(), timers.total);

    info!(
        total_matches,
        total_us = timers.total.as_micros() as u64,
        partition_us = timers.partition.as_micros() as u64,
        join_us = timers.join.as_micros() as u64,
        build_us = timers.build.as_micros() as u64,
        probe_us = timers.probe.as_micros() as u64,
        throughput,
        "radix join done"
    );

    Ok(JoinResult {
        total_matches,
        nthreads: config.nthreads,
        per_thread,
        throughput,
        timers,
        plan,
        output,
    })
}
