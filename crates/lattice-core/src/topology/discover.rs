//! # Topology Discovery
//!
//! Produces a [`SystemDescriptor`] describing the machine and turns it
//! into a [`CpuTree`].
//!
//! Discovery happens once, at construction time:
//! - Linux: one-shot enumeration of `/sys/devices/system/cpu` and
//!   `/sys/devices/system/node`
//! - Other platforms: a synthetic single-package descriptor built from the
//!   logical CPU count
//!
//! The descriptor is an explicit value rather than process-wide state so
//! tests can supply synthetic topologies without touching the filesystem.

use fxhash::{FxHashMap, FxHashSet};

use super::error::TopologyError;
use super::level::TopologyLevel;
use super::tree::CpuTree;
use crate::cpuset::{Cpu, CpuSet};

/// Description of the whole machine, the input to tree construction.
#[derive(Debug, Clone, Default)]
pub struct SystemDescriptor {
    /// Physical CPU packages.
    pub packages: Vec<PackageDescriptor>,
    /// For each CPU, the hardware threads sharing its physical core
    /// (including the CPU itself).
    pub thread_siblings: FxHashMap<Cpu, CpuSet>,
}

/// One physical package (socket).
#[derive(Debug, Clone)]
pub struct PackageDescriptor {
    /// Package id as reported by the OS.
    pub id: usize,
    /// Dies on this package.
    pub dies: Vec<DieDescriptor>,
}

/// One die within a package.
#[derive(Debug, Clone)]
pub struct DieDescriptor {
    /// Die id, unique within the package.
    pub id: usize,
    /// NUMA nodes on this die.
    pub nodes: Vec<NumaNodeDescriptor>,
}

/// One NUMA node.
#[derive(Debug, Clone)]
pub struct NumaNodeDescriptor {
    /// NUMA node id as reported by the OS.
    pub id: usize,
    /// All CPUs of the node.
    pub cpus: CpuSet,
    /// The distinct level-2 caches shared by the node's CPUs.
    pub caches: Vec<CacheDescriptor>,
}

/// One level-2 cache.
#[derive(Debug, Clone)]
pub struct CacheDescriptor {
    /// Cache id, unique within its NUMA node.
    pub id: usize,
    /// The CPUs this cache serves.
    pub cpus: CpuSet,
}

impl SystemDescriptor {
    /// Discovers the topology of the machine this process runs on.
    ///
    /// On Linux this enumerates sysfs; failures map to
    /// [`TopologyError::DiscoveryFailed`]. Elsewhere a synthetic
    /// single-package topology is returned.
    pub fn discover() -> Result<Self, TopologyError> {
        #[cfg(target_os = "linux")]
        {
            Self::discover_sysfs()
        }
        #[cfg(not(target_os = "linux"))]
        {
            Ok(Self::synthetic(num_cpus::get()))
        }
    }

    /// Builds a flat single-package descriptor for `cpu_count` CPUs, each
    /// CPU its own physical core.
    #[must_use]
    pub fn synthetic(cpu_count: usize) -> Self {
        let cpus: CpuSet = (0..cpu_count).collect();
        let thread_siblings = (0..cpu_count)
            .map(|cpu| (cpu, CpuSet::single(cpu)))
            .collect();
        SystemDescriptor {
            packages: vec![PackageDescriptor {
                id: 0,
                dies: vec![DieDescriptor {
                    id: 0,
                    nodes: vec![NumaNodeDescriptor {
                        id: 0,
                        cpus: cpus.clone(),
                        caches: vec![CacheDescriptor { id: 0, cpus }],
                    }],
                }],
            }],
            thread_siblings,
        }
    }

    #[cfg(target_os = "linux")]
    fn discover_sysfs() -> Result<Self, TopologyError> {
        use std::collections::BTreeMap;
        use std::path::Path;

        let cpu_root = Path::new("/sys/devices/system/cpu");
        if !cpu_root.exists() {
            return Err(TopologyError::DiscoveryFailed(format!(
                "{} not found",
                cpu_root.display()
            )));
        }

        // Online CPUs; the logical CPU count is the fallback.
        let online = match sysfs::read_cpulist(&cpu_root.join("online")) {
            Some(set) if !set.is_empty() => set,
            _ => (0..num_cpus::get()).collect(),
        };
        if online.is_empty() {
            return Err(TopologyError::DiscoveryFailed(
                "no online CPUs".to_string(),
            ));
        }

        let mut cpu_package: FxHashMap<Cpu, usize> = FxHashMap::default();
        let mut cpu_die: FxHashMap<Cpu, usize> = FxHashMap::default();
        let mut cpu_l2: FxHashMap<Cpu, (usize, CpuSet)> = FxHashMap::default();
        let mut thread_siblings: FxHashMap<Cpu, CpuSet> = FxHashMap::default();

        for cpu in online.iter() {
            let topo = cpu_root.join(format!("cpu{cpu}/topology"));
            cpu_package.insert(cpu, sysfs::read_id(&topo.join("physical_package_id")).unwrap_or(0));
            cpu_die.insert(cpu, sysfs::read_id(&topo.join("die_id")).unwrap_or(0));
            let siblings = sysfs::read_cpulist(&topo.join("core_cpus_list"))
                .or_else(|| sysfs::read_cpulist(&topo.join("thread_siblings_list")))
                .unwrap_or_else(|| CpuSet::single(cpu));
            thread_siblings.insert(cpu, siblings);

            if let Some(cache) = sysfs::find_l2_cache(&cpu_root.join(format!("cpu{cpu}/cache")), cpu)
            {
                cpu_l2.insert(cpu, cache);
            }
        }

        // NUMA node id -> CPUs. Machines without a node directory are
        // treated as one node spanning everything.
        let mut node_cpus: BTreeMap<usize, CpuSet> = BTreeMap::new();
        let node_root = Path::new("/sys/devices/system/node");
        if node_root.exists() {
            let entries = std::fs::read_dir(node_root).map_err(|e| {
                TopologyError::DiscoveryFailed(format!(
                    "failed to read {}: {e}",
                    node_root.display()
                ))
            })?;
            for entry in entries {
                let entry = entry.map_err(|e| {
                    TopologyError::DiscoveryFailed(format!(
                        "failed to read {}: {e}",
                        node_root.display()
                    ))
                })?;
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let Some(id) = name.strip_prefix("node").and_then(|id| id.parse().ok()) else {
                    continue;
                };
                if let Some(cpus) = sysfs::read_cpulist(&entry.path().join("cpulist")) {
                    let cpus = cpus.intersection(&online);
                    if !cpus.is_empty() {
                        node_cpus.insert(id, cpus);
                    }
                }
            }
        }
        if node_cpus.is_empty() {
            node_cpus.insert(0, online.clone());
        }

        // Group NUMA nodes under (package, die) and caches under nodes.
        let mut grouped: BTreeMap<usize, BTreeMap<usize, BTreeMap<usize, CpuSet>>> =
            BTreeMap::new();
        for (&node_id, cpus) in &node_cpus {
            for cpu in cpus.iter() {
                grouped
                    .entry(cpu_package[&cpu])
                    .or_default()
                    .entry(cpu_die[&cpu])
                    .or_default()
                    .entry(node_id)
                    .or_default()
                    .insert(cpu);
            }
        }

        let mut packages = Vec::with_capacity(grouped.len());
        for (package_id, dies) in grouped {
            let mut package = PackageDescriptor {
                id: package_id,
                dies: Vec::with_capacity(dies.len()),
            };
            for (die_id, nodes) in dies {
                let mut die = DieDescriptor {
                    id: die_id,
                    nodes: Vec::with_capacity(nodes.len()),
                };
                for (node_id, cpus) in nodes {
                    let mut caches: BTreeMap<usize, CpuSet> = BTreeMap::new();
                    let mut uncached = CpuSet::new();
                    for cpu in cpus.iter() {
                        if let Some((id, shared)) = cpu_l2.get(&cpu) {
                            let entry = caches.entry(*id).or_default();
                            *entry = entry.union(&shared.intersection(&cpus));
                        } else {
                            uncached.insert(cpu);
                        }
                    }
                    if caches.is_empty() {
                        // No cache information at all: one cache spanning
                        // the node keeps every CPU reachable in the tree.
                        caches.insert(0, cpus.clone());
                    } else if !uncached.is_empty() {
                        tracing::warn!(
                            "CPUs {} of NUMA node {} report no L2 cache, leaving them out",
                            uncached,
                            node_id
                        );
                    }
                    die.nodes.push(NumaNodeDescriptor {
                        id: node_id,
                        cpus,
                        caches: caches
                            .into_iter()
                            .map(|(id, cpus)| CacheDescriptor { id, cpus })
                            .collect(),
                    });
                }
                package.dies.push(die);
            }
            packages.push(package);
        }

        Ok(SystemDescriptor {
            packages,
            thread_siblings,
        })
    }
}

#[cfg(target_os = "linux")]
mod sysfs {
    use std::path::Path;

    use crate::cpuset::{Cpu, CpuSet};

    pub(super) fn read_id(path: &Path) -> Option<usize> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
    }

    pub(super) fn read_cpulist(path: &Path) -> Option<CpuSet> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|text| text.trim().parse().ok())
    }

    /// Scans `cacheroot/index*` for the level-2 cache serving `cpu`.
    pub(super) fn find_l2_cache(cache_root: &Path, cpu: Cpu) -> Option<(usize, CpuSet)> {
        for index in 0.. {
            let dir = cache_root.join(format!("index{index}"));
            if !dir.exists() {
                return None;
            }
            if read_id(&dir.join("level")) != Some(2) {
                continue;
            }
            let id = read_id(&dir.join("id")).unwrap_or(0);
            let shared = read_cpulist(&dir.join("shared_cpu_list"))
                .unwrap_or_else(|| CpuSet::single(cpu));
            return Some((id, shared));
        }
        None
    }
}

impl CpuTree {
    /// Builds the topology tree from a system descriptor.
    ///
    /// Node names follow the fixed convention the allocator's orderings
    /// tie-break on: `system`, `p<ID>`, `<package>d<ID>`, `<die>n<ID>`,
    /// `<numa>$<ID>`, `<numa>cpu<firstCPU>`, `<core>t<CPU>`.
    #[must_use]
    pub fn from_system(system: &SystemDescriptor) -> CpuTree {
        let mut tree = CpuTree::new("system", TopologyLevel::System);
        let root = tree.root();
        for package in &system.packages {
            let package_id =
                tree.add_child(root, format!("p{}", package.id), TopologyLevel::Package);
            for die in &package.dies {
                let name = format!("{}d{}", tree.name(package_id), die.id);
                let die_id = tree.add_child(package_id, name, TopologyLevel::Die);
                for node in &die.nodes {
                    let name = format!("{}n{}", tree.name(die_id), node.id);
                    let node_id = tree.add_child(die_id, name, TopologyLevel::Numa);
                    for cache in &node.caches {
                        let name = format!("{}${}", tree.name(node_id), cache.id);
                        let cache_id = tree.add_child(node_id, name, TopologyLevel::L2Cache);
                        let mut threads_seen: FxHashSet<Cpu> = FxHashSet::default();
                        for cpu in cache.cpus.list() {
                            if threads_seen.contains(&cpu) {
                                continue;
                            }
                            let name = format!("{}cpu{cpu}", tree.name(node_id));
                            let core_id = tree.add_child(cache_id, name, TopologyLevel::Core);
                            let siblings = system
                                .thread_siblings
                                .get(&cpu)
                                .cloned()
                                .unwrap_or_else(|| CpuSet::single(cpu));
                            for thread in siblings.list() {
                                threads_seen.insert(thread);
                                let name = format!("{}t{thread}", tree.name(core_id));
                                let thread_id =
                                    tree.add_child(core_id, name, TopologyLevel::Thread);
                                tree.add_cpus(thread_id, &CpuSet::single(thread));
                            }
                        }
                    }
                }
            }
        }
        tree
    }
}

/// Discovers the machine topology and builds its tree in one step.
pub fn system_tree() -> Result<CpuTree, TopologyError> {
    let system = SystemDescriptor::discover()?;
    let tree = CpuTree::from_system(&system);
    tracing::info!(
        "CPU topology: {} nodes, cpus {}",
        tree.node_count(),
        tree.cpus(tree.root())
    );
    tracing::debug!("topology tree:\n{}", tree.pretty_print());
    Ok(tree)
}
