//! The resizer pipeline.
//!
//! A resize request threads `(current, free, delta)` through a fixed chain
//! of resizers. Each stage either answers directly or consults the
//! remainder of the chain, possibly several times with narrowed inputs;
//! the terminal stage returns the narrowed sets verbatim. Determinism
//! comes from ascending CPU enumeration wherever pick order matters, the
//! name tie-break in the candidate orderings, and stable sorting.

use std::fmt;

use fxhash::FxHashMap;

use super::error::ResizeError;
use super::hints::{HintProvider, SysfsHintProvider};
use super::options::AllocatorOptions;
use super::order::{allocate_order, release_order};
use crate::cpuset::{Cpu, CpuSet};
use crate::topology::{CpuTree, TopologyLevel};

/// Candidate sets returned by [`CpuTreeAllocator::resize_cpus`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeResult {
    /// Free CPUs to allocate from when growing. May hold more than `delta`
    /// equally good candidates; the caller picks `delta` of them.
    pub add_from: CpuSet,
    /// Owned CPUs to release from when shrinking. May hold more than
    /// `|delta|` candidates.
    pub remove_from: CpuSet,
}

/// The fixed resizer chain, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resizer {
    OnlyIfNecessary,
    DynamicDeviceHints,
    DeviceHints,
    OneAtATime,
    MaxLocalSet,
    Terminal,
}

const RESIZER_CHAIN: [Resizer; 6] = [
    Resizer::OnlyIfNecessary,
    Resizer::DynamicDeviceHints,
    Resizer::DeviceHints,
    Resizer::OneAtATime,
    Resizer::MaxLocalSet,
    Resizer::Terminal,
];

type Sets = (CpuSet, CpuSet);

/// Topology-aware CPU allocator bound to one tree and one option record.
///
/// The tree is fixed at construction (including the synthetic
/// physical-core split when
/// [`prefer_spread_on_physical_cores`](AllocatorOptions::prefer_spread_on_physical_cores)
/// is set). The only mutable state is the device hint cache, which grows
/// monotonically; resize calls must be serialized by the caller.
pub struct CpuTreeAllocator {
    pub(crate) tree: CpuTree,
    pub(crate) options: AllocatorOptions,
    pub(crate) hint_cache: FxHashMap<String, Vec<CpuSet>>,
    pub(crate) hint_provider: Box<dyn HintProvider>,
}

impl fmt::Debug for CpuTreeAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuTreeAllocator")
            .field("tree", &self.tree.to_string())
            .field("options", &self.options)
            .field("hint_cache", &self.hint_cache)
            .finish_non_exhaustive()
    }
}

impl CpuTreeAllocator {
    /// Creates an allocator with the default sysfs hint provider.
    #[must_use]
    pub fn new(tree: CpuTree, options: AllocatorOptions) -> Self {
        Self::with_hint_provider(tree, options, Box::new(SysfsHintProvider))
    }

    /// Creates an allocator that resolves device hints through `provider`.
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub fn with_hint_provider(
        tree: CpuTree,
        options: AllocatorOptions,
        provider: Box<dyn HintProvider>,
    ) -> Self {
        let tree = if options.prefer_spread_on_physical_cores {
            // Classify each CPU by its hyperthread position within its
            // physical core, so that "first thread of each core" becomes a
            // branch distinct from "second thread of each core". Every CPU
            // in the tree has a thread leaf; missing ones fall back to
            // class 0.
            tree.split_level(TopologyLevel::Numa, |cpu| {
                tree.find_leaf_with_cpu(cpu)
                    .map_or(0, |leaf| tree.sibling_index(leaf).max(0) as usize)
            })
        } else {
            tree
        };
        let hint_cache = options.virt_dev_cpusets.clone().unwrap_or_default();
        CpuTreeAllocator {
            tree,
            options,
            hint_cache,
            hint_provider: provider,
        }
    }

    /// Returns the tree the allocator works on, after any construction
    /// time split.
    #[must_use]
    pub fn tree(&self) -> &CpuTree {
        &self.tree
    }

    /// Computes candidate sets for resizing a workload's CPUs.
    ///
    /// `current` is the workload's CPU set, `free` the allocatable CPUs,
    /// and `delta` the number of CPUs to add (positive) or release
    /// (negative). No CPUs are allocated or released; the caller applies
    /// the result.
    ///
    /// # Errors
    ///
    /// [`ResizeError::InsufficientFreeCpus`] /
    /// [`ResizeError::InsufficientCurrentCpus`] when the request cannot be
    /// satisfied, [`ResizeError::Internal`] on a pipeline invariant
    /// violation.
    pub fn resize_cpus(
        &mut self,
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<ResizeResult, ResizeError> {
        let (add_from, remove_from) = self.next_resizer(&RESIZER_CHAIN, current, free, delta)?;
        Ok(ResizeResult {
            add_from,
            remove_from,
        })
    }

    fn next_resizer(
        &mut self,
        chain: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        let Some((stage, rest)) = chain.split_first() else {
            return Err(ResizeError::Internal(
                "a CPU resizer consulted the next resizer but there was no one left".to_string(),
            ));
        };
        tracing::debug!("resizer-{}({}, {}, {})", rest.len(), current, free, delta);
        match stage {
            Resizer::OnlyIfNecessary => self.resize_only_if_necessary(rest, current, free, delta),
            Resizer::DynamicDeviceHints => {
                self.resize_with_dynamic_device_hints(rest, current, free, delta)
            }
            Resizer::DeviceHints => self.resize_with_device_hints(rest, current, free, delta),
            Resizer::OneAtATime => self.resize_one_at_a_time(rest, current, free, delta),
            Resizer::MaxLocalSet => self.resize_max_local_set(rest, current, free, delta),
            // The terminal stage: every allocation from free and every
            // release from current is equally good from here on.
            Resizer::Terminal => Ok((free.clone(), current.clone())),
        }
    }

    /// Fast path for trivial requests, and the place where impossible
    /// requests fail.
    fn resize_only_if_necessary(
        &mut self,
        rest: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        let want = delta.unsigned_abs() as usize;
        if delta == 0 {
            return Ok((CpuSet::new(), CpuSet::new()));
        }
        if delta > 0 {
            if free.len() < want {
                return Err(ResizeError::InsufficientFreeCpus {
                    available: free.len(),
                    requested: want,
                });
            }
            if free.len() == want {
                // Allocate all the remaining free CPUs.
                return Ok((free.clone(), CpuSet::new()));
            }
        } else {
            if current.len() < want {
                return Err(ResizeError::InsufficientCurrentCpus {
                    available: current.len(),
                    requested: want,
                });
            }
            if current.len() == want {
                // Free all allocated CPUs.
                return Ok((CpuSet::new(), current.clone()));
            }
        }
        self.next_resizer(rest, current, free, delta)
    }

    /// Allocates through the device-update callback, one CPU at a time.
    ///
    /// Each selected CPU may change which CPUs are good to select next, so
    /// after the first pick every further CPU is chosen by a fresh
    /// single-CPU query. The initial full-delta query seeds the first pick
    /// with a globally good CPU.
    fn resize_with_dynamic_device_hints(
        &mut self,
        rest: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        let Some(update_devices) = self.options.device_update_on_every_cpu.clone() else {
            return self.next_resizer(rest, current, free, delta);
        };
        update_devices(current);
        if delta <= 0 {
            return self.next_resizer(rest, current, free, delta);
        }
        let want = delta.unsigned_abs() as usize;
        let (mut add_from, mut remove_from) = self.next_resizer(rest, current, free, delta)?;
        if add_from.len() < want {
            return Ok((add_from, remove_from));
        }
        let mut current = current.clone();
        let mut free = free.clone();
        let mut added = CpuSet::new();
        loop {
            // The pool is non-empty here; take its smallest CPU.
            let Some(cpu) = add_from.first() else { break };
            added = added.union(&CpuSet::single(cpu));
            if added.len() >= want {
                break;
            }
            current = current.union(&CpuSet::single(cpu));
            free = free.difference(&current);
            update_devices(&current);
            let (next_add, next_remove) = self.next_resizer(rest, &current, &free, 1)?;
            add_from = next_add;
            remove_from = next_remove;
            if add_from.is_empty() {
                return Ok((added, remove_from));
            }
        }
        Ok((added.union(&add_from), remove_from))
    }

    /// Prefers allocating CPUs close to preferred devices and releasing
    /// CPUs that are not.
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    fn resize_with_device_hints(
        &mut self,
        rest: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        // Hinted CPU sets in priority order: earlier entries win conflicts.
        let close_devices = self.options.prefer_close_to_devices.clone();
        let far_devices = self.options.prefer_far_from_devices.clone();
        let mut all_close_cpu_sets: Vec<Vec<CpuSet>> = Vec::new();
        for device in &close_devices {
            let close_cpu_sets = self.topology_hint_cpus(device);
            if !close_cpu_sets.is_empty() {
                all_close_cpu_sets.push(close_cpu_sets);
            }
        }
        // A far-device hint counts every CPU outside the hinted set as
        // close. Computed over free and current alike so that it can both
        // steer growth and rank shrink victims.
        let pool = free.union(current);
        for device in &far_devices {
            for far_cpu_set in self.topology_hint_cpus(device) {
                all_close_cpu_sets.push(vec![pool.difference(&far_cpu_set)]);
            }
        }
        if all_close_cpu_sets.is_empty() {
            return self.next_resizer(rest, current, free, delta);
        }

        let want = delta.unsigned_abs() as usize;
        if delta > 0 {
            // Narrow freeCpus by intersecting hints in priority order,
            // keeping an intersection only while it can still satisfy the
            // whole request.
            let mut remaining_free = free.clone();
            let mut applied_hints = 0;
            let mut total_hints = 0;
            for close_cpu_sets in &all_close_cpu_sets {
                for cpus in close_cpu_sets {
                    total_hints += 1;
                    let narrowed = remaining_free.intersection(cpus);
                    if narrowed.len() >= want {
                        applied_hints += 1;
                        tracing::debug!("take hinted cpus {}, common free {}", cpus, narrowed);
                        remaining_free = narrowed;
                    } else {
                        tracing::debug!(
                            "drop hinted cpus {}, not enough common free in {}",
                            cpus,
                            narrowed
                        );
                    }
                }
            }
            tracing::debug!(
                "free cpus {}, took {}/{} hints, remaining free: {}",
                free,
                applied_hints,
                total_hints,
                remaining_free
            );
            return self.next_resizer(rest, current, &remaining_free, delta);
        }
        if delta < 0 {
            // Score every owned CPU with a bitmask over the hint groups,
            // highest priority in the most significant bit. CPUs scoring
            // below the releasable threshold are freed for sure; the
            // threshold scorers are handed to the rest of the chain, which
            // picks the topology-best among them.
            let groups = all_close_cpu_sets.len();
            let mut hint_scores: FxHashMap<Cpu, u64> = FxHashMap::default();
            for (priority, close_cpu_sets) in all_close_cpu_sets.iter().enumerate() {
                for cpus in close_cpu_sets {
                    let owned = cpus.intersection(current);
                    for cpu in owned.iter() {
                        *hint_scores.entry(cpu).or_insert(0) += 1 << (groups - 1 - priority);
                    }
                }
            }
            let score_of =
                |cpu: Cpu| -> u64 { hint_scores.get(&cpu).copied().unwrap_or(0) };
            let mut least_hinted = current.list();
            least_hinted.sort_by_key(|&cpu| score_of(cpu));
            // The only-if-necessary stage guarantees current is strictly
            // larger than the request, so the threshold index exists.
            let Some(&threshold_cpu) = least_hinted.get(want) else {
                return Err(ResizeError::Internal(format!(
                    "device hint resizer got delta {} for {} current CPUs",
                    delta,
                    current.len()
                )));
            };
            let threshold = score_of(threshold_cpu);
            let mut free_for_sure = CpuSet::new();
            let mut free_maybe = CpuSet::new();
            for &cpu in &least_hinted {
                if score_of(cpu) > threshold {
                    break;
                }
                if score_of(cpu) < threshold {
                    free_for_sure.insert(cpu);
                } else {
                    free_maybe.insert(cpu);
                }
            }
            let remaining_delta = delta + free_for_sure.len() as i32;
            tracing::debug!(
                "device hints: from cpus {}: free for sure: {} and {} more from: {}",
                current,
                free_for_sure,
                -remaining_delta,
                free_maybe
            );
            let (_, free_from_maybe) =
                self.next_resizer(rest, &free_maybe, free, remaining_delta)?;
            // Top up from the maybe set only until the request is covered,
            // so that every least-hinted CPU stays released.
            for cpu in free_from_maybe.iter() {
                if free_for_sure.len() >= want {
                    break;
                }
                free_for_sure.insert(cpu);
            }
            return Ok((free.clone(), free_for_sure));
        }
        Ok((free.clone(), current.clone()))
    }

    /// Selects CPUs one by one whenever single picks are not
    /// interchangeable: always on release, and on growth when hyperthread
    /// spreading makes the pooled candidates unequal.
    fn resize_one_at_a_time(
        &mut self,
        rest: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        let want = delta.unsigned_abs() as usize;
        if delta > 0 {
            let (add_superset, remove_superset) = self.next_resizer(rest, current, free, delta)?;
            if !self.options.prefer_spread_on_physical_cores || add_superset.len() == want {
                return Ok((add_superset, remove_superset));
            }
            // The pool holds more CPUs than needed and, with hyperthread
            // spreading, they are not equally good. Re-select one CPU at a
            // time, updating the working sets after each pick.
            let mut current = current.clone();
            let mut free = free.clone();
            let mut add_from = CpuSet::new();
            for round in 0..want {
                let (add_single, _) = self.next_resizer(rest, &current, &free, 1)?;
                if add_single.len() != 1 {
                    return Err(ResizeError::Internal(format!(
                        "failed to find a single CPU to allocate, current={current} free={free} candidates={add_single}"
                    )));
                }
                add_from = add_from.union(&add_single);
                if add_from.len() != round + 1 {
                    return Err(ResizeError::Internal(format!(
                        "double allocation of CPU {add_single} into {add_from} on round {}",
                        round + 1
                    )));
                }
                current = current.union(&add_single);
                free = free.difference(&add_single);
            }
            return Ok((add_from, remove_superset));
        }
        // Multi-CPU release: remove one CPU at a time instead of looking
        // for a single topology element that could give up all of them.
        let mut current = current.clone();
        let mut free = free.clone();
        let mut remove_from = CpuSet::new();
        for round in 0..want {
            let (_, remove_single) = self.next_resizer(rest, &current, &free, -1)?;
            if remove_single.len() != 1 {
                return Err(ResizeError::Internal(format!(
                    "failed to find a single CPU to free, current={current} free={free} candidates={remove_single}"
                )));
            }
            if remove_from.union(&remove_single).len() != round + 1 {
                return Err(ResizeError::Internal(format!(
                    "double release of CPU {remove_single}, already released {remove_from}"
                )));
            }
            remove_from = remove_from.union(&remove_single);
            current = current.difference(&remove_single);
            free = free.union(&remove_single);
        }
        Ok((CpuSet::new(), remove_from))
    }

    /// Scores every subtree that could satisfy the request locally and
    /// narrows the working sets to the best one.
    fn resize_max_local_set(
        &mut self,
        rest: &[Resizer],
        current: &CpuSet,
        free: &CpuSet,
        delta: i32,
    ) -> Result<Sets, ResizeError> {
        let want = delta.unsigned_abs() as usize;
        let mut records = self.tree.to_attributed_slice(current, free, |attributes| {
            // Filter out branches that cannot satisfy the delta locally.
            if delta > 0 && attributes.free_count < want {
                return false;
            }
            if delta < 0 && attributes.current_count < want {
                return false;
            }
            true
        });
        if delta > 0 {
            let balancing = self.options.topology_balancing;
            records.sort_by(|a, b| allocate_order(balancing, a, b));
        } else {
            records.sort_by(|a, b| release_order(a, b));
        }
        let Some(best) = records.first() else {
            return Err(ResizeError::InsufficientFreeCpus {
                available: free.len(),
                requested: want,
            });
        };
        let (best_current, best_free) = (best.current_cpus.clone(), best.free_cpus.clone());
        self.next_resizer(rest, &best_current, &best_free, delta)
    }
}
