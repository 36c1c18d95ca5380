use clap::Parser;
use radixjoin::{
    DataGen, JoinConfig, Materialized, OutputShape, PartitionAlgorithm, QueueKind, run_join,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Radix hash join benchmark.
#[derive(Parser, Debug)]
#[command(name = "radixbench", version, about)]
struct Args {
    /// Join algorithm (RHO, RHT)
    #[arg(short, long, default_value = "RHO")]
    algorithm: String,

    /// Rows of the build relation R
    #[arg(short, long, default_value_t = 2_097_152)]
    r_size: usize,

    /// Rows of the probe relation S
    #[arg(short, long, default_value_t = 2_097_152)]
    s_size: usize,

    #[arg(short, long, default_value_t = 2)]
    nthreads: usize,

    /// Percentage of S rows with a partner in R
    #[arg(short = 'l', long, default_value_t = 100)]
    selectivity: u32,

    /// Zipf factor of S keys; 0 disables skew
    #[arg(short = 'z', long, default_value_t = 0.0)]
    skew: f64,

    /// Materialize the join output
    #[arg(short, long)]
    materialize: bool,

    /// Fixed number of radix bits instead of the cache-size heuristic
    #[arg(long)]
    radix_bits: Option<u32>,

    #[arg(long, default_value_t = 11111)]
    r_seed: u64,

    #[arg(long, default_value_t = 22222)]
    s_seed: u64,

    #[arg(long)]
    sort_r: bool,

    #[arg(long)]
    sort_s: bool,

    /// Partition with software write-combining buffers
    #[arg(long)]
    swwc: bool,

    /// Use the mutex-guarded task queue
    #[arg(long)]
    mutex_queue: bool,

    /// Materialize into a chunked table instead of linked lists
    #[arg(long)]
    chunked: bool,

    /// Always partition in two passes
    #[arg(long)]
    two_passes: bool,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("radixjoin=info")),
        )
        .init();

    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> radixjoin::Result<()> {
    info!(r_size = args.r_size, seed = args.r_seed, "building R");
    let r = DataGen::new(args.r_seed)
        .sorted(args.sort_r)
        .primary_keys(args.r_size);

    let mut s_gen = DataGen::new(args.s_seed).sorted(args.sort_s);
    let s = if args.skew > 0.0 {
        info!(s_size = args.s_size, skew = args.skew, "building S (zipf)");
        s_gen.zipf_keys(args.s_size, args.r_size, args.skew)
    } else if args.selectivity != 100 {
        info!(s_size = args.s_size, selectivity = args.selectivity, "building S");
        s_gen.foreign_keys_selectivity(args.s_size, args.r_size, args.selectivity)
    } else {
        info!(s_size = args.s_size, "building S");
        s_gen.foreign_keys(args.s_size, args.r_size)
    };

    let config = JoinConfig::default()
        .with_nthreads(args.nthreads)
        .with_radix_bits(args.radix_bits)
        .with_materialize(args.materialize)
        .with_partition(if args.swwc {
            PartitionAlgorithm::WriteCombining
        } else {
            PartitionAlgorithm::Scalar
        })
        .with_queue(if args.mutex_queue {
            QueueKind::Mutex
        } else {
            QueueKind::LockFree
        })
        .with_output(if args.chunked {
            OutputShape::Chunked { prealloc: true }
        } else {
            OutputShape::LinkedList
        })
        .with_force_two_passes(args.two_passes);

    let result = run_join(&r, &s, &args.algorithm, &config)?;

    let materialized = match &result.output {
        Materialized::None => 0,
        Materialized::LinkedLists(lists) => lists.iter().map(|t| t.list.len()).sum(),
        Materialized::Chunked(table) => table.len(),
    };
    info!(
        matches = result.total_matches,
        materialized,
        runtime_us = result.timers.total.as_micros() as u64,
        throughput_mrows = result.throughput,
        "done"
    );
    println!(
        "matches = {}, runtime = {:?}, throughput = {:.2} M rows/s",
        result.total_matches, result.timers.total, result.throughput
    );
    Ok(())
}
