#![cfg_attr(feature = "nightly", feature(core_intrinsics))]
#![cfg_attr(feature = "nightly", allow(internal_features))]
//! Parallel radix hash join.
//!
//! Both relations are radix-partitioned on the low key bits by all worker
//! threads together, in one or two passes, until every partition of the
//! build side fits in cache. The co-partitioned pairs are then handed out as
//! tasks and joined with an in-cache kernel.
//!
//! ```no_run
//! use radixjoin::{DataGen, JoinConfig, run_join};
//!
//! let mut data = DataGen::new(11111);
//! let r = data.primary_keys(1 << 20);
//! let s = data.foreign_keys(1 << 22, 1 << 20);
//! let config = JoinConfig::default().with_nthreads(4);
//! let result = run_join(&r, &s, "RHO", &config).unwrap();
//! assert_eq!(result.total_matches, 1 << 22);
//! ```
pub mod barrier;
pub mod buffer;
pub mod datagen;
pub mod error;
pub mod join;
pub mod kernel;
pub mod output;
pub mod partition;
pub mod pipeline;
pub mod planner;
pub mod queue;
pub mod row;

pub use datagen::DataGen;
pub use error::{Error, Result};
pub use join::{ALGORITHMS, JoinConfig, JoinResult, run_join};
pub use kernel::JoinKernel;
pub use output::{ChunkedTable, Materialized, OutputList, OutputShape, ThreadOutput};
pub use partition::{PartitionAlgorithm, PartitionedRelation, partition_relation};
pub use pipeline::{RadixTimers, ThreadStats};
pub use planner::RadixPlan;
pub use queue::QueueKind;
pub use row::{Key, OutputTriple, Payload, Row, Table};
