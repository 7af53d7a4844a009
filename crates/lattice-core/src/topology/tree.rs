//! The CPU topology tree.
//!
//! Nodes live in a flat arena indexed by [`NodeId`]; parent and child links
//! are arena ids, so deep copies are plain clones and back-references never
//! dangle. Every node carries the union of its descendants' CPUs, kept up
//! to date by [`CpuTree::add_cpus`] as thread leaves are populated.

use std::collections::BTreeMap;
use std::fmt;

use smallvec::SmallVec;

use super::level::{TopologyLevel, LEVEL_COUNT};
use crate::cpuset::{Cpu, CpuSet};

/// Identifier of a node within one [`CpuTree`] arena.
///
/// Ids are only meaningful for the tree (or clones of the tree) that
/// created them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

/// Step decision returned by a [`CpuTree::walk`] handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Continue with this node's children, then its siblings.
    Continue,
    /// Do not descend into this node's children; continue with siblings.
    SkipChildren,
    /// Abort the entire walk; reported to the outermost caller.
    Stop,
}

#[derive(Debug, Clone)]
struct TreeNode {
    name: String,
    level: TopologyLevel,
    parent: Option<NodeId>,
    children: SmallVec<[NodeId; 8]>,
    cpus: CpuSet,
}

/// A CPU topology tree.
///
/// Construct with [`CpuTree::new`] and [`CpuTree::add_child`], or from a
/// discovered [`SystemDescriptor`](super::SystemDescriptor) with
/// [`CpuTree::from_system`]. Cloning performs a deep copy preserving
/// names, levels, CPU sets, and structure.
#[derive(Debug, Clone)]
pub struct CpuTree {
    nodes: Vec<TreeNode>,
}

impl CpuTree {
    /// Creates a tree holding a single root node with no CPUs.
    #[must_use]
    pub fn new(name: impl Into<String>, level: TopologyLevel) -> Self {
        let mut tree = CpuTree { nodes: Vec::new() };
        tree.push_node(name.into(), level, None, CpuSet::new());
        tree
    }

    /// Returns the root node.
    #[must_use]
    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    /// Returns the number of nodes in the tree.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    fn node(&self, id: NodeId) -> &TreeNode {
        &self.nodes[id.index()]
    }

    #[allow(clippy::cast_possible_truncation)]
    fn push_node(
        &mut self,
        name: String,
        level: TopologyLevel,
        parent: Option<NodeId>,
        cpus: CpuSet,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(TreeNode {
            name,
            level,
            parent,
            children: SmallVec::new(),
            cpus,
        });
        if let Some(parent) = parent {
            self.nodes[parent.index()].children.push(id);
        }
        id
    }

    /// Appends a new child node under `parent` and returns its id.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        name: impl Into<String>,
        level: TopologyLevel,
    ) -> NodeId {
        self.push_node(name.into(), level, Some(parent), CpuSet::new())
    }

    /// Adds CPUs to a node and to all of its ancestors.
    ///
    /// Maintains the union invariant (`node.cpus` equals the union of its
    /// descendants' CPUs) as thread leaves are populated.
    pub fn add_cpus(&mut self, node: NodeId, cpus: &CpuSet) {
        let mut at = Some(node);
        while let Some(id) = at {
            let here = &mut self.nodes[id.index()];
            here.cpus = here.cpus.union(cpus);
            at = here.parent;
        }
    }

    /// Returns the name of a node.
    #[must_use]
    pub fn name(&self, node: NodeId) -> &str {
        &self.node(node).name
    }

    /// Returns the topology level of a node.
    #[must_use]
    pub fn level(&self, node: NodeId) -> TopologyLevel {
        self.node(node).level
    }

    /// Returns the CPUs of a node.
    #[must_use]
    pub fn cpus(&self, node: NodeId) -> &CpuSet {
        &self.node(node).cpus
    }

    /// Returns the children of a node in insertion order.
    #[must_use]
    pub fn children(&self, node: NodeId) -> &[NodeId] {
        &self.node(node).children
    }

    /// Returns the parent of a node, or `None` for the root.
    #[must_use]
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        self.node(node).parent
    }

    /// Returns true if the node has no children.
    #[must_use]
    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.node(node).children.is_empty()
    }

    /// Returns the distance from the root node.
    #[must_use]
    pub fn depth(&self, node: NodeId) -> usize {
        let mut depth = 0;
        let mut at = self.node(node).parent;
        while let Some(id) = at {
            depth += 1;
            at = self.node(id).parent;
        }
        depth
    }

    /// Returns the index of this node among its parent's children.
    ///
    /// Returns −1 for the root node and −2 if the node is not listed among
    /// its parent's children. Both are diagnostic values, never valid
    /// indices.
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn sibling_index(&self, node: NodeId) -> isize {
        let Some(parent) = self.node(node).parent else {
            return -1;
        };
        for (index, &child) in self.node(parent).children.iter().enumerate() {
            if child == node {
                return index as isize;
            }
        }
        -2
    }

    /// Walks the subtree under `from` in pre-order.
    ///
    /// The handler decides each step: [`Walk::Continue`] descends,
    /// [`Walk::SkipChildren`] skips the node's subtree, and [`Walk::Stop`]
    /// aborts the walk; the abort is reported back as the return value.
    pub fn walk<F: FnMut(NodeId) -> Walk>(&self, from: NodeId, handler: &mut F) -> Walk {
        match handler(from) {
            Walk::SkipChildren => return Walk::Continue,
            Walk::Stop => return Walk::Stop,
            Walk::Continue => {}
        }
        for &child in &self.node(from).children {
            if self.walk(child, handler) == Walk::Stop {
                return Walk::Stop;
            }
        }
        Walk::Continue
    }

    /// Returns the first leaf whose CPUs contain `cpu`, in pre-order.
    #[must_use]
    pub fn find_leaf_with_cpu(&self, cpu: Cpu) -> Option<NodeId> {
        let mut found = None;
        self.walk(self.root(), &mut |node| {
            if !self.is_leaf(node) {
                return Walk::Continue;
            }
            if self.cpus(node).contains(cpu) {
                found = Some(node);
                return Walk::Stop;
            }
            Walk::Continue
        });
        found
    }

    /// Returns, per level from the node's level downwards, the names of
    /// subtrees whose CPUs intersect `cpus`, in pre-order.
    ///
    /// Example: on a two-package system,
    /// `locations(root, "0,99")` = `[["system"], ["p0", "p1"], ...]`.
    #[must_use]
    pub fn cpu_locations(&self, from: NodeId, cpus: &CpuSet) -> Vec<Vec<String>> {
        let base = self.level(from).value();
        let mut names = vec![Vec::new(); LEVEL_COUNT - base];
        self.walk(from, &mut |node| {
            if self.cpus(node).intersection(cpus).is_empty() {
                return Walk::SkipChildren;
            }
            names[self.level(node).value() - base].push(self.name(node).to_string());
            Walk::Continue
        });
        names
    }

    /// Returns a new tree in which every node at `split` level has been
    /// fanned out into synthetic per-class children.
    ///
    /// `classifier` assigns each CPU of the tree to a class. Each node at
    /// the split level is given one child per class (named
    /// `<name>class<k>`, at the same level, in ascending class order);
    /// under it the node's original subtrees reappear with their CPU sets
    /// intersected with the class's CPUs. Subtrees whose CPU sets become
    /// empty are pruned. The tree above the split level is a structural
    /// copy.
    #[must_use]
    pub fn split_level<F: Fn(Cpu) -> usize>(
        &self,
        split: TopologyLevel,
        classifier: F,
    ) -> CpuTree {
        let mut class_cpus: BTreeMap<usize, CpuSet> = BTreeMap::new();
        for cpu in self.cpus(self.root()).iter() {
            class_cpus.entry(classifier(cpu)).or_default().insert(cpu);
        }
        let masks: Vec<(usize, CpuSet)> = class_cpus.into_iter().collect();

        let mut out = CpuTree {
            nodes: Vec::with_capacity(self.nodes.len()),
        };
        self.split_copy(self.root(), None, split, &masks, &mut out);
        out
    }

    fn split_copy(
        &self,
        node: NodeId,
        parent: Option<NodeId>,
        split: TopologyLevel,
        masks: &[(usize, CpuSet)],
        out: &mut CpuTree,
    ) {
        let src = self.node(node);
        let id = out.push_node(src.name.clone(), src.level, parent, src.cpus.clone());
        if src.level == split {
            for (class, mask) in masks {
                let class_cpus = src.cpus.intersection(mask);
                if class_cpus.is_empty() {
                    continue;
                }
                let class_id = out.push_node(
                    format!("{}class{}", src.name, class),
                    src.level,
                    Some(id),
                    class_cpus,
                );
                for &child in &src.children {
                    self.masked_copy(child, class_id, mask, out);
                }
            }
        } else {
            for &child in &src.children {
                self.split_copy(child, Some(id), split, masks, out);
            }
        }
    }

    fn masked_copy(&self, node: NodeId, parent: NodeId, mask: &CpuSet, out: &mut CpuTree) {
        let src = self.node(node);
        let cpus = src.cpus.intersection(mask);
        if cpus.is_empty() {
            return;
        }
        let id = out.push_node(src.name.clone(), src.level, Some(parent), cpus);
        for &child in &src.children {
            self.masked_copy(child, id, mask, out);
        }
    }

    /// Renders the tree one node per line, indented by depth.
    #[must_use]
    pub fn pretty_print(&self) -> String {
        let mut lines = Vec::with_capacity(self.nodes.len());
        self.walk(self.root(), &mut |node| {
            lines.push(format!(
                "{}{}: {:?} cpus: {}",
                "    ".repeat(self.depth(node)),
                self.level(node),
                self.name(node),
                self.cpus(node)
            ));
            Walk::Continue
        });
        lines.join("\n")
    }

    fn fmt_subtree(&self, node: NodeId, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name(node))?;
        if !self.is_leaf(node) {
            f.write_str("[")?;
            for (index, &child) in self.node(node).children.iter().enumerate() {
                if index > 0 {
                    f.write_str(" ")?;
                }
                self.fmt_subtree(child, f)?;
            }
            f.write_str("]")?;
        }
        Ok(())
    }
}

impl fmt::Display for CpuTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_subtree(self.root(), f)
    }
}
