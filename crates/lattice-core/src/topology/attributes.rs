//! Attributed tree flattening.
//!
//! When allocating or releasing CPUs, every tree node that could take part
//! in the operation is flattened into one record carrying everything the
//! candidate comparison needs, so that the scoring phase never walks the
//! tree again.

use std::fmt;

use smallvec::SmallVec;

use super::tree::{CpuTree, NodeId};
use crate::cpuset::CpuSet;

/// Per-ancestor-depth counts along the path from the root to a node.
///
/// Eight slots cover the deepest possible path (all seven topology levels
/// plus one synthetic split level) without spilling to the heap.
pub type DepthCounts = SmallVec<[usize; 8]>;

/// One flattened tree node with the attributes the allocate/release
/// orderings compare.
#[derive(Debug, Clone)]
pub struct NodeAttributes {
    /// The node this record describes.
    pub node: NodeId,
    /// Name of the node; the final ordering tie-break.
    pub name: String,
    /// Distance from the walk root.
    pub depth: usize,
    /// CPUs of the node owned by the workload being resized.
    pub current_cpus: CpuSet,
    /// CPUs of the node available for allocation.
    pub free_cpus: CpuSet,
    /// Size of [`current_cpus`](Self::current_cpus).
    pub current_count: usize,
    /// Size of [`free_cpus`](Self::free_cpus).
    pub free_count: usize,
    /// Owned-CPU counts of each ancestor, root first, this node last.
    pub current_counts: DepthCounts,
    /// Free-CPU counts of each ancestor, root first, this node last.
    pub free_counts: DepthCounts,
}

impl fmt::Display for NodeAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{{{},{:?},{},{:?}}}",
            self.name, self.depth, self.current_counts, self.free_count, self.free_counts
        )
    }
}

impl CpuTree {
    /// Flattens the tree into attributed records for one resize decision.
    ///
    /// `current` is the set of CPUs that could be freed and `free` the set
    /// that could be allocated; both are intersected with each node's CPUs.
    /// `filter` is consulted before a record is emitted; rejecting a node
    /// skips its entire subtree.
    #[must_use]
    pub fn to_attributed_slice<F: Fn(&NodeAttributes) -> bool>(
        &self,
        current: &CpuSet,
        free: &CpuSet,
        filter: F,
    ) -> Vec<NodeAttributes> {
        let mut records = Vec::new();
        self.attribute_node(
            self.root(),
            current,
            free,
            &filter,
            &mut records,
            0,
            &DepthCounts::new(),
            &DepthCounts::new(),
        );
        records
    }

    #[allow(clippy::too_many_arguments)]
    fn attribute_node<F: Fn(&NodeAttributes) -> bool>(
        &self,
        node: NodeId,
        current: &CpuSet,
        free: &CpuSet,
        filter: &F,
        records: &mut Vec<NodeAttributes>,
        depth: usize,
        current_counts: &DepthCounts,
        free_counts: &DepthCounts,
    ) {
        let current_here = self.cpus(node).intersection(current);
        let free_here = self.cpus(node).intersection(free);
        let mut current_counts = current_counts.clone();
        current_counts.push(current_here.len());
        let mut free_counts = free_counts.clone();
        free_counts.push(free_here.len());

        let record = NodeAttributes {
            node,
            name: self.name(node).to_string(),
            depth,
            current_count: current_here.len(),
            free_count: free_here.len(),
            current_cpus: current_here,
            free_cpus: free_here,
            current_counts: current_counts.clone(),
            free_counts: free_counts.clone(),
        };
        if !filter(&record) {
            return;
        }
        records.push(record);
        for &child in self.children(node) {
            self.attribute_node(
                child,
                current,
                free,
                filter,
                records,
                depth + 1,
                &current_counts,
                &free_counts,
            );
        }
    }
}
