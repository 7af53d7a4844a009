//! Allocator error types.

/// Errors from a resize request.
///
/// For the two insufficiency errors the candidate sets are fully
/// determined by the caller's inputs: nothing can be allocated beyond
/// `free` and nothing released beyond `current`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResizeError {
    /// More CPUs were requested than are free, either up front or in the
    /// subtree-scoring stage where no subtree could satisfy the request.
    #[error("not enough free CPUs ({available}) to allocate {requested} CPUs")]
    InsufficientFreeCpus {
        /// Free CPUs available.
        available: usize,
        /// CPUs requested.
        requested: usize,
    },

    /// More CPUs were asked to be released than the workload owns.
    #[error("not enough allocated CPUs ({available}) to release {requested} CPUs")]
    InsufficientCurrentCpus {
        /// CPUs currently owned.
        available: usize,
        /// CPUs asked to be released.
        requested: usize,
    },

    /// A pipeline stage broke an internal invariant; indicates a bug in a
    /// resizer, not bad caller input.
    #[error("internal error: {0}")]
    Internal(String),
}
