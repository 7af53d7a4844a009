//! Candidate orderings over attributed tree nodes.
//!
//! Both orderings are strict weak orders where `Less` means "better
//! candidate": sorting a slice of [`NodeAttributes`] puts the optimal
//! subtree first. Records compared together always stem from the same
//! attributed slice, so equal depths imply equally long count vectors.

use std::cmp::Ordering;

use crate::topology::NodeAttributes;

/// Ordering for choosing the subtree to allocate CPUs from.
///
/// Keys, in order: deeper nodes first; higher owned-CPU counts per
/// ancestor depth (keep the workload cohesive as high in the tree as
/// possible); free-CPU counts per ancestor depth, direction set by
/// `balancing`; ascending name.
pub(crate) fn allocate_order(
    balancing: bool,
    a: &NodeAttributes,
    b: &NodeAttributes,
) -> Ordering {
    match b.depth.cmp(&a.depth) {
        Ordering::Equal => {}
        unequal => return unequal,
    }
    for (own, other) in a.current_counts.iter().zip(&b.current_counts) {
        // The chosen subtree's currentCpus will grow: maximize the owned
        // count as high in the topology as possible.
        match other.cmp(own) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    for (own, other) in a.free_counts.iter().zip(&b.free_counts) {
        // The chosen subtree's freeCpus will shrink.
        if own != other {
            return if balancing {
                // Goal: minimize the maximal free count in the topology.
                other.cmp(own)
            } else {
                // Goal: maximize the maximal free count in the topology.
                own.cmp(other)
            };
        }
    }
    a.name.cmp(&b.name)
}

/// Ordering for choosing the subtree to release CPUs from.
///
/// Keys, in order: deeper nodes first; lower owned-CPU counts per ancestor
/// depth (defragment: clear out the branch holding the least of the
/// workload); lower free-CPU counts per ancestor depth; descending name.
///
/// The balancing option does not modify the free-count key here; both
/// modes prefer less free. Kept as-is until the asymmetry with
/// [`allocate_order`] is revisited.
pub(crate) fn release_order(a: &NodeAttributes, b: &NodeAttributes) -> Ordering {
    match b.depth.cmp(&a.depth) {
        Ordering::Equal => {}
        unequal => return unequal,
    }
    for (own, other) in a.current_counts.iter().zip(&b.current_counts) {
        // The chosen subtree's currentCpus will shrink: minimize the owned
        // count as high in the topology as possible.
        match own.cmp(other) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    for (own, other) in a.free_counts.iter().zip(&b.free_counts) {
        match own.cmp(other) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
    }
    b.name.cmp(&a.name)
}
