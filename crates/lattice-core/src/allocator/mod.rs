//! # Topology-Aware CPU Allocator
//!
//! Decides which CPUs to grant to or reclaim from a workload when its CPU
//! quota is resized. The allocator never allocates by itself: each
//! [`CpuTreeAllocator::resize_cpus`] call returns candidate sets that are
//! topology-optimal, and the caller picks from them, free to apply its own
//! secondary tie-breakers.
//!
//! ## Architecture
//!
//! A resize call threads `(current, free, delta)` through a fixed chain of
//! resizers, each of which either answers directly or narrows the inputs
//! and consults the remainder of the chain:
//!
//! ```text
//! only-if-necessary     trivial deltas, insufficiency errors
//!   dynamic-device-hints  one-CPU-at-a-time re-evaluation around a
//!                         caller-provided device-update callback
//!     static-device-hints   prefer CPUs close to / far from devices
//!       one-at-a-time         per-CPU iteration for hyperthread
//!                             spreading and multi-CPU release
//!         max-local-set         score subtrees, narrow to the best one
//!           terminal              return the narrowed sets verbatim
//! ```
//!
//! ## Components
//!
//! - [`CpuTreeAllocator`] - the allocator bound to a topology tree and
//!   options
//! - [`AllocatorOptions`] - the recognized settings
//! - [`HintProvider`] - resolves "CPUs close to a device" hints, cached
//!   per device path

mod error;
mod hints;
mod options;
mod order;
mod resize;

#[cfg(test)]
mod tests;

pub use error::ResizeError;
pub use hints::{HintError, HintProvider, SysfsHintProvider, TopologyHint};
pub use options::{AllocatorOptions, DeviceUpdateFn};
pub use resize::{CpuTreeAllocator, ResizeResult};

/// Result type for allocator operations.
pub type Result<T> = std::result::Result<T, ResizeError>;
