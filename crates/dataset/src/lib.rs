//! Strata ordered dataset layer
//!
//! A partitioned stream of region values plus an ordered range
//! partitioner. The layer reasons about sort order to perform shuffles,
//! joins, and coalescing without unnecessary redistribution: operations
//! that cannot disturb the order keep the partitioner, re-partitioning
//! operations recompute bounds deterministically, and `coerce` picks
//! AS_IS / LOCAL_SORT / SHUFFLE from observed sortedness.
//!
//! The execution runtime is abstracted behind `ComputePool` - the single
//! seam where a concrete runtime binds. `LocalPool` runs partitions on
//! coroutines in-process.

pub mod coerce;
pub mod config;
pub mod join;
pub mod partitioner;
pub mod pool;
pub mod rvd;
pub mod rvd_type;
pub mod stream;
pub mod write;

pub use coerce::{PartitionKeyInfo, Sortedness};
pub use config::EngineConfig;
pub use join::JoinType;
pub use partitioner::OrderedPartitioner;
pub use pool::{ComputePool, LocalPool};
pub use rvd::OrderedRvd;
pub use rvd_type::OrderedRvdType;
pub use stream::{PartSource, RowStream};
