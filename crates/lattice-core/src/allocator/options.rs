//! Allocator options.

use std::fmt;
use std::sync::Arc;

use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::cpuset::CpuSet;

/// Callback invoked with the workload's CPUs after every tentatively
/// chosen CPU, letting an external device model update before the next
/// pick.
pub type DeviceUpdateFn = Arc<dyn Fn(&CpuSet) + Send + Sync>;

/// Settings recognized by the allocator.
///
/// The plain fields round-trip through serde so an enclosing policy can
/// carry them in its configuration; the callback is runtime-only.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AllocatorOptions {
    /// True prefers allocating from branches with the most free CPUs
    /// (spread), false from branches with the least (pack).
    pub topology_balancing: bool,

    /// Group hyperthreads of distinct physical cores into synthetic
    /// topology classes and select one CPU at a time, so that allocations
    /// land on distinct physical cores before filling sibling threads.
    pub prefer_spread_on_physical_cores: bool,

    /// Device paths whose close CPUs should be favored.
    pub prefer_close_to_devices: Vec<String>,

    /// Device paths whose close CPUs should be avoided.
    pub prefer_far_from_devices: Vec<String>,

    /// Pre-resolved device CPU sets; when present, used in place of the
    /// hint provider.
    pub virt_dev_cpusets: Option<FxHashMap<String, Vec<CpuSet>>>,

    /// Invoked after each single tentatively chosen CPU; forces the
    /// dynamic-device-hint resizer to re-evaluate CPU by CPU.
    #[serde(skip)]
    pub device_update_on_every_cpu: Option<DeviceUpdateFn>,
}

impl fmt::Debug for AllocatorOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AllocatorOptions")
            .field("topology_balancing", &self.topology_balancing)
            .field(
                "prefer_spread_on_physical_cores",
                &self.prefer_spread_on_physical_cores,
            )
            .field("prefer_close_to_devices", &self.prefer_close_to_devices)
            .field("prefer_far_from_devices", &self.prefer_far_from_devices)
            .field("virt_dev_cpusets", &self.virt_dev_cpusets)
            .field(
                "device_update_on_every_cpu",
                &self.device_update_on_every_cpu.as_ref().map(|_| "..."),
            )
            .finish()
    }
}
