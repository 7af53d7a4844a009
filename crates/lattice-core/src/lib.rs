//! # Lattice Core
//!
//! The topology-aware CPU allocation engine for Lattice, deciding which
//! physical CPUs a workload should be granted or give back when its CPU
//! quota is resized.
//!
//! This crate provides:
//! - **CPU sets**: dense hardware-thread sets with set algebra and the
//!   kernel's range-compact text form (`0-3,8,10-11`)
//! - **Topology tree**: a socket/die/NUMA/cache/core/thread hierarchy built
//!   from sysfs or from a caller-supplied descriptor
//! - **Allocator**: a resizer pipeline that turns `(current, free, delta)`
//!   into topology-optimal candidate sets for allocation and release
//!
//! ## Design Principles
//!
//! 1. **Candidates, not side effects** - the engine never pins threads or
//!    writes cgroups; it returns the sets the caller should pick from
//! 2. **Deterministic tie-breaks** - identical inputs always produce
//!    identical candidate sets
//! 3. **Emit many, pick later** - candidate pools may exceed the requested
//!    delta so callers can apply their own secondary preferences
//! 4. **No hidden state** - topology is an explicit constructor argument;
//!    the only cache is the per-device hint cache
//!
//! ## Example
//!
//! ```rust,ignore
//! use lattice_core::allocator::{AllocatorOptions, CpuTreeAllocator};
//! use lattice_core::topology::{CpuTree, SystemDescriptor};
//!
//! let tree = CpuTree::from_system(&SystemDescriptor::discover()?);
//! let mut allocator = CpuTreeAllocator::new(tree, AllocatorOptions::default());
//!
//! // Grow the workload by two CPUs.
//! let result = allocator.resize_cpus(&current, &free, 2)?;
//! println!("allocate from: {}", result.add_from);
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod allocator;
pub mod cpuset;
pub mod topology;

// Re-export key types
pub use allocator::{AllocatorOptions, CpuTreeAllocator, ResizeResult};
pub use cpuset::{Cpu, CpuSet};
pub use topology::{CpuTree, NodeId, TopologyLevel};

/// Result type for lattice-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lattice-core
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// CPU set parsing errors
    #[error("CPU set error: {0}")]
    CpuSet(#[from] cpuset::CpuSetError),

    /// Topology discovery and tree errors
    #[error("Topology error: {0}")]
    Topology(#[from] topology::TopologyError),

    /// Resize pipeline errors
    #[error("Resize error: {0}")]
    Resize(#[from] allocator::ResizeError),

    /// Device topology hint errors
    #[error("Hint error: {0}")]
    Hint(#[from] allocator::HintError),
}
