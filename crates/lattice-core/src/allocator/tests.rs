//! End-to-end tests for the resizer pipeline on a small reference
//! topology: 1 package, 1 die, 1 NUMA node, two L2 caches (`$0` = 0-3,
//! `$1` = 4-7), each cache over two physical cores of two hyperthreads.

use std::sync::{Arc, Mutex};

use fxhash::FxHashMap;

use super::{
    AllocatorOptions, CpuTreeAllocator, HintError, HintProvider, ResizeError, TopologyHint,
};
use crate::cpuset::CpuSet;
use crate::topology::{
    CacheDescriptor, CpuTree, DieDescriptor, NumaNodeDescriptor, PackageDescriptor,
    SystemDescriptor,
};

fn two_cache_system() -> SystemDescriptor {
    let mut thread_siblings = FxHashMap::default();
    for core in 0..4 {
        let pair: CpuSet = [core * 2, core * 2 + 1].into_iter().collect();
        thread_siblings.insert(core * 2, pair.clone());
        thread_siblings.insert(core * 2 + 1, pair);
    }
    SystemDescriptor {
        packages: vec![PackageDescriptor {
            id: 0,
            dies: vec![DieDescriptor {
                id: 0,
                nodes: vec![NumaNodeDescriptor {
                    id: 0,
                    cpus: (0..8).collect(),
                    caches: vec![
                        CacheDescriptor {
                            id: 0,
                            cpus: (0..4).collect(),
                        },
                        CacheDescriptor {
                            id: 1,
                            cpus: (4..8).collect(),
                        },
                    ],
                }],
            }],
        }],
        thread_siblings,
    }
}

fn tree() -> CpuTree {
    CpuTree::from_system(&two_cache_system())
}

fn allocator(options: AllocatorOptions) -> CpuTreeAllocator {
    CpuTreeAllocator::new(tree(), options)
}

fn cpus(list: &[usize]) -> CpuSet {
    list.iter().copied().collect()
}

/// Hint provider backed by a fixed map, counting how often it is asked.
struct RecordingProvider {
    hints: FxHashMap<String, Vec<TopologyHint>>,
    calls: Arc<Mutex<usize>>,
}

impl RecordingProvider {
    fn new(hints: &[(&str, &str)]) -> (Self, Arc<Mutex<usize>>) {
        let calls = Arc::new(Mutex::new(0));
        let hints = hints
            .iter()
            .map(|(path, cpus)| {
                (
                    (*path).to_string(),
                    vec![TopologyHint {
                        cpus: (*cpus).to_string(),
                    }],
                )
            })
            .collect();
        (
            RecordingProvider {
                hints,
                calls: calls.clone(),
            },
            calls,
        )
    }
}

impl HintProvider for RecordingProvider {
    fn topology_hints(&self, path: &str) -> Result<Vec<TopologyHint>, HintError> {
        *self.calls.lock().unwrap() += 1;
        self.hints.get(path).cloned().ok_or_else(|| HintError::NotFound {
            path: path.to_string(),
        })
    }
}

// ---- Trivial deltas and insufficiency ----

#[test]
fn test_zero_delta_returns_empty_sets() {
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator
        .resize_cpus(&cpus(&[0, 1]), &cpus(&[2, 3]), 0)
        .unwrap();
    assert!(result.add_from.is_empty());
    assert!(result.remove_from.is_empty());
}

#[test]
fn test_grow_saturates_to_all_free() {
    let mut allocator = allocator(AllocatorOptions::default());
    let free = cpus(&[2, 5, 7]);
    let result = allocator.resize_cpus(&cpus(&[0]), &free, 3).unwrap();
    assert_eq!(result.add_from, free);
    assert!(result.remove_from.is_empty());
}

#[test]
fn test_shrink_saturates_to_all_current() {
    let mut allocator = allocator(AllocatorOptions::default());
    let current = cpus(&[0, 1, 4]);
    let result = allocator
        .resize_cpus(&current, &cpus(&[2, 3]), -3)
        .unwrap();
    assert!(result.add_from.is_empty());
    assert_eq!(result.remove_from, current);
}

#[test]
fn test_grow_insufficient_free() {
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator.resize_cpus(&CpuSet::new(), &cpus(&[3]), 2);
    assert_eq!(
        result.unwrap_err(),
        ResizeError::InsufficientFreeCpus {
            available: 1,
            requested: 2
        }
    );
}

#[test]
fn test_shrink_insufficient_current() {
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator.resize_cpus(&cpus(&[0]), &CpuSet::new(), -2);
    assert_eq!(
        result.unwrap_err(),
        ResizeError::InsufficientCurrentCpus {
            available: 1,
            requested: 2
        }
    );
}

// ---- Topology-driven growth ----

#[test]
fn test_grow_on_idle_machine_picks_deepest_subtree() {
    // With the whole machine free and no allocation to stay close to, the
    // deepest subtree that can satisfy the request wins outright and the
    // balancing mode cannot change the outcome: both pick one physical
    // core.
    for balancing in [false, true] {
        let mut allocator = allocator(AllocatorOptions {
            topology_balancing: balancing,
            ..AllocatorOptions::default()
        });
        let result = allocator
            .resize_cpus(&CpuSet::new(), &(0..8).collect(), 2)
            .unwrap();
        assert_eq!(result.add_from, cpus(&[0, 1]), "balancing={balancing}");
    }
}

#[test]
fn test_balanced_allocation_spreads_across_caches() {
    // CPUs 0-1 are taken by someone else. Balancing steers the new
    // allocation into the cache with the most headroom.
    let mut allocator = allocator(AllocatorOptions {
        topology_balancing: true,
        ..AllocatorOptions::default()
    });
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(2..8).collect(), 2)
        .unwrap();
    assert_eq!(result.add_from, cpus(&[4, 5]));
}

#[test]
fn test_packed_allocation_fills_used_cache() {
    // Same machine state without balancing: pack next to the existing
    // allocation, inside the fuller cache.
    let mut allocator = allocator(AllocatorOptions {
        topology_balancing: false,
        ..AllocatorOptions::default()
    });
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(2..8).collect(), 2)
        .unwrap();
    assert_eq!(result.add_from, cpus(&[2, 3]));
}

#[test]
fn test_grow_stays_cohesive() {
    // Growing an existing allocation prefers the free hyperthread sibling
    // over CPUs in the idle cache.
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator
        .resize_cpus(&cpus(&[0]), &cpus(&[1, 4, 5]), 1)
        .unwrap();
    assert_eq!(result.add_from, cpus(&[1]));
}

// ---- Physical-core spreading ----

#[test]
fn test_allocator_splits_tree_on_construction() {
    let allocator = allocator(AllocatorOptions {
        prefer_spread_on_physical_cores: true,
        ..AllocatorOptions::default()
    });
    let tree = allocator.tree();
    let text = tree.pretty_print();
    assert!(text.contains("\"p0d0n0class0\" cpus: 0,2,4,6"));
    assert!(text.contains("\"p0d0n0class1\" cpus: 1,3,5,7"));
}

#[test]
fn test_spread_on_physical_cores_avoids_hyperthread_siblings() {
    let mut allocator = allocator(AllocatorOptions {
        prefer_spread_on_physical_cores: true,
        topology_balancing: true,
        ..AllocatorOptions::default()
    });
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 2)
        .unwrap();
    // Two CPUs on two different physical cores, never 0-1 or any other
    // sibling pair.
    assert_eq!(result.add_from, cpus(&[0, 2]));
}

#[test]
fn test_spread_shrink_releases_one_by_one() {
    let mut allocator = allocator(AllocatorOptions {
        prefer_spread_on_physical_cores: true,
        ..AllocatorOptions::default()
    });
    let result = allocator
        .resize_cpus(&cpus(&[0, 1]), &(2..8).collect(), -1)
        .unwrap();
    assert_eq!(result.remove_from, cpus(&[1]));
}

// ---- Topology-driven release ----

#[test]
fn test_shrink_defragments() {
    // CPU 4 sits alone in cache $1; releasing it keeps the remaining
    // allocation in one cache.
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator
        .resize_cpus(&cpus(&[0, 1, 4]), &cpus(&[2, 3, 5, 6, 7]), -1)
        .unwrap();
    assert_eq!(result.remove_from, cpus(&[4]));
}

#[test]
fn test_shrink_two_releases_isolated_then_sibling() {
    let mut allocator = allocator(AllocatorOptions::default());
    let result = allocator
        .resize_cpus(&cpus(&[0, 1, 4]), &cpus(&[2, 3, 5, 6, 7]), -2)
        .unwrap();
    // First the isolated CPU 4, then the higher-numbered of the sibling
    // pair (the release ordering breaks name ties downwards).
    assert_eq!(result.remove_from, cpus(&[1, 4]));
}

// ---- Device hints ----

#[test]
fn test_device_close_grow() {
    let (provider, _) = RecordingProvider::new(&[("/devA", "4-5")]);
    let mut allocator = CpuTreeAllocator::with_hint_provider(
        tree(),
        AllocatorOptions {
            prefer_close_to_devices: vec!["/devA".to_string()],
            ..AllocatorOptions::default()
        },
        Box::new(provider),
    );
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 1)
        .unwrap();
    assert_eq!(result.add_from, cpus(&[4]));
    assert!(result.add_from.difference(&cpus(&[4, 5])).is_empty());
}

#[test]
fn test_device_far_grow() {
    let (provider, _) = RecordingProvider::new(&[("/devA", "4-5")]);
    let mut allocator = CpuTreeAllocator::with_hint_provider(
        tree(),
        AllocatorOptions {
            prefer_far_from_devices: vec!["/devA".to_string()],
            ..AllocatorOptions::default()
        },
        Box::new(provider),
    );
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 2)
        .unwrap();
    assert!(result.add_from.intersection(&cpus(&[4, 5])).is_empty());
    assert_eq!(result.add_from, cpus(&[6, 7]));
}

#[test]
fn test_device_far_shrink_releases_device_close_cpus_first() {
    let (provider, _) = RecordingProvider::new(&[("/devA", "4-5")]);
    let mut allocator = CpuTreeAllocator::with_hint_provider(
        tree(),
        AllocatorOptions {
            prefer_far_from_devices: vec!["/devA".to_string()],
            ..AllocatorOptions::default()
        },
        Box::new(provider),
    );
    let result = allocator
        .resize_cpus(&cpus(&[0, 4, 5]), &cpus(&[1, 2, 3, 6, 7]), -2)
        .unwrap();
    // The CPUs close to the shunned device score lowest and are freed
    // first.
    assert_eq!(result.remove_from, cpus(&[4, 5]));
}

#[test]
fn test_provider_failure_degrades_to_topology_and_caches() {
    let (provider, calls) = RecordingProvider::new(&[]);
    let mut allocator = CpuTreeAllocator::with_hint_provider(
        tree(),
        AllocatorOptions {
            prefer_close_to_devices: vec!["/gone".to_string()],
            ..AllocatorOptions::default()
        },
        Box::new(provider),
    );
    let first = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 2)
        .unwrap();
    let second = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 2)
        .unwrap();
    // Hint resolution failed; allocation falls back to pure topology.
    assert_eq!(first.add_from, cpus(&[0, 1]));
    assert_eq!(second, first);
    // The failure is cached: the provider was asked exactly once.
    assert_eq!(*calls.lock().unwrap(), 1);
}

#[test]
fn test_virt_dev_cpusets_bypass_provider() {
    let (provider, calls) = RecordingProvider::new(&[("/devA", "0-1")]);
    let mut cpusets = FxHashMap::default();
    cpusets.insert("/devA".to_string(), vec![cpus(&[6, 7])]);
    let mut allocator = CpuTreeAllocator::with_hint_provider(
        tree(),
        AllocatorOptions {
            prefer_close_to_devices: vec!["/devA".to_string()],
            virt_dev_cpusets: Some(cpusets),
            ..AllocatorOptions::default()
        },
        Box::new(provider),
    );
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 1)
        .unwrap();
    // The pre-resolved cpuset wins and the provider is never consulted.
    assert_eq!(result.add_from, cpus(&[6]));
    assert_eq!(*calls.lock().unwrap(), 0);
}

#[test]
fn test_dynamic_device_hints_reevaluate_each_cpu() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let mut allocator = allocator(AllocatorOptions {
        device_update_on_every_cpu: Some(Arc::new(move |current: &CpuSet| {
            recorder.lock().unwrap().push(current.to_string());
        })),
        ..AllocatorOptions::default()
    });
    let result = allocator
        .resize_cpus(&CpuSet::new(), &(0..8).collect(), 3)
        .unwrap();
    assert_eq!(result.add_from, cpus(&[0, 1, 2]));
    // The device model saw the allocation grow one CPU at a time.
    assert_eq!(*seen.lock().unwrap(), vec!["", "0", "0-1"]);
}

// ---- Universal invariants ----

#[test]
fn test_resize_invariants() {
    let cases: &[(&[usize], &[usize], i32)] = &[
        (&[], &[0, 1, 2, 3, 4, 5, 6, 7], 1),
        (&[], &[0, 1, 2, 3, 4, 5, 6, 7], 5),
        (&[0], &[1, 2, 3], 2),
        (&[0, 1, 4], &[2, 3, 5, 6, 7], -1),
        (&[0, 1, 2, 3], &[4, 5, 6, 7], -3),
        (&[0, 5], &[1, 4], 0),
    ];
    for options in [
        AllocatorOptions::default(),
        AllocatorOptions {
            topology_balancing: true,
            ..AllocatorOptions::default()
        },
        AllocatorOptions {
            prefer_spread_on_physical_cores: true,
            ..AllocatorOptions::default()
        },
    ] {
        for &(current, free, delta) in cases {
            let mut allocator = allocator(options.clone());
            let (current, free) = (cpus(current), cpus(free));
            let result = allocator.resize_cpus(&current, &free, delta).unwrap();
            let label = format!("current={current} free={free} delta={delta}");

            // Containment and disjointness.
            assert!(result.add_from.difference(&free).is_empty(), "{label}");
            assert!(result.remove_from.difference(&current).is_empty(), "{label}");
            assert!(result.add_from.intersection(&current).is_empty(), "{label}");
            assert!(result.remove_from.intersection(&free).is_empty(), "{label}");

            // Size bounds.
            if delta > 0 {
                assert!(
                    result.add_from.len() >= delta.unsigned_abs() as usize,
                    "{label}"
                );
            }
            if delta < 0 {
                assert!(
                    result.remove_from.len() >= delta.unsigned_abs() as usize,
                    "{label}"
                );
            }
            if delta == 0 {
                assert!(result.add_from.is_empty(), "{label}");
                assert!(result.remove_from.is_empty(), "{label}");
            }
        }
    }
}

#[test]
fn test_resize_is_deterministic() {
    for _ in 0..3 {
        let mut a = allocator(AllocatorOptions {
            topology_balancing: true,
            ..AllocatorOptions::default()
        });
        let mut b = allocator(AllocatorOptions {
            topology_balancing: true,
            ..AllocatorOptions::default()
        });
        let current = cpus(&[0, 6]);
        let free = cpus(&[1, 2, 3, 4, 5, 7]);
        let first = a.resize_cpus(&current, &free, 2).unwrap();
        let second = b.resize_cpus(&current, &free, 2).unwrap();
        assert_eq!(first, second);
        // Repeating the call on the same allocator does not drift either.
        assert_eq!(a.resize_cpus(&current, &free, 2).unwrap(), first);
    }
}
