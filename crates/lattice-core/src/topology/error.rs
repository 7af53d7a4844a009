//! Topology error types.

/// Errors from CPU topology discovery.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    /// The hardware topology could not be enumerated.
    #[error("topology discovery failed: {0}")]
    DiscoveryFailed(String),
}
