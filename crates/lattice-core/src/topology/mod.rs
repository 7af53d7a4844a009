//! # CPU Topology
//!
//! A tree model of the machine: packages contain dies, dies contain NUMA
//! nodes, NUMA nodes contain level-2 caches, caches contain physical
//! cores, and cores contain hardware threads.
//!
//! ## Components
//!
//! - [`CpuTree`] - the topology tree with walking, lookup, and level
//!   splitting
//! - [`SystemDescriptor`] - the discovery input; read from sysfs once at
//!   startup or supplied synthetically by tests
//! - [`NodeAttributes`] - flattened per-node records consumed by the
//!   allocator's candidate orderings
//!
//! Node names follow a fixed convention (`system`, `p0`, `p0d0`, `p0d0n0`,
//! `p0d0n0$1`, `p0d0n0cpu4`, `p0d0n0cpu4t5`). The allocator breaks scoring
//! ties on these names, so they are part of the ordering contract.

mod attributes;
mod discover;
mod error;
mod level;
mod tree;

pub use attributes::{DepthCounts, NodeAttributes};
pub use discover::{
    system_tree, CacheDescriptor, DieDescriptor, NumaNodeDescriptor, PackageDescriptor,
    SystemDescriptor,
};
pub use error::TopologyError;
pub use level::{ParseLevelError, TopologyLevel, LEVEL_COUNT};
pub use tree::{CpuTree, NodeId, Walk};

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;
