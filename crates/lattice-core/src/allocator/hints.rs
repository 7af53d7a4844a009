//! Device topology hints.
//!
//! A hint declares a set of CPUs "close to" a device path. Hints are
//! resolved lazily through a [`HintProvider`] and cached per path for the
//! allocator's lifetime; a provider failure degrades the path to an empty
//! hint list and is logged once.

use std::path::Path;

use crate::cpuset::CpuSet;

use super::resize::CpuTreeAllocator;

/// One topology hint for a device: a CPU set in range-compact notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyHint {
    /// The CPUs close to the device, e.g. `"24-27,56-59"`.
    pub cpus: String,
}

/// Errors from resolving device topology hints.
#[derive(Debug, thiserror::Error)]
pub enum HintError {
    /// Neither the device path nor any of its ancestors carries topology
    /// information.
    #[error("no topology information for device {path:?}")]
    NotFound {
        /// The device path that was queried.
        path: String,
    },

    /// A topology attribute exists but could not be read.
    #[error("failed to read device attributes: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves the topology hints of a device path.
///
/// Hint order is meaningful: earlier hints are stronger.
pub trait HintProvider {
    /// Returns the topology hints for `path`.
    fn topology_hints(&self, path: &str) -> Result<Vec<TopologyHint>, HintError>;
}

/// The default provider: reads `local_cpulist` from sysfs.
///
/// Looks for the attribute at the device path itself, then walks towards
/// the filesystem root; the closest ancestor carrying `local_cpulist`
/// describes the device's locality.
#[derive(Debug, Clone, Copy, Default)]
pub struct SysfsHintProvider;

impl HintProvider for SysfsHintProvider {
    fn topology_hints(&self, path: &str) -> Result<Vec<TopologyHint>, HintError> {
        let mut dir = Some(Path::new(path));
        while let Some(here) = dir {
            let attr = here.join("local_cpulist");
            if attr.is_file() {
                let cpus = std::fs::read_to_string(&attr)?;
                return Ok(vec![TopologyHint {
                    cpus: cpus.trim().to_string(),
                }]);
            }
            dir = here.parent();
        }
        Err(HintError::NotFound {
            path: path.to_string(),
        })
    }
}

impl CpuTreeAllocator {
    /// Returns the hinted CPU sets of a device, resolving and caching them
    /// on first use.
    ///
    /// The returned order is the provider's order and is treated as
    /// priority. Provider errors are reported once per path; afterwards
    /// the cached empty entry is reused silently.
    pub(crate) fn topology_hint_cpus(&mut self, dev: &str) -> Vec<CpuSet> {
        if let Some(cached) = self.hint_cache.get(dev) {
            return cached.clone();
        }
        let sets = match self.hint_provider.topology_hints(dev) {
            Ok(hints) => {
                let mut sets = Vec::with_capacity(hints.len());
                for hint in hints {
                    match hint.cpus.parse::<CpuSet>() {
                        Ok(cpus) => sets.push(cpus),
                        Err(error) => tracing::warn!(
                            "ignoring malformed topology hint {:?} for device {:?}: {}",
                            hint.cpus,
                            dev,
                            error
                        ),
                    }
                }
                sets
            }
            Err(error) => {
                tracing::error!("failed to find topology of device {:?}: {}", dev, error);
                Vec::new()
            }
        };
        self.hint_cache.insert(dev.to_string(), sets.clone());
        sets
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysfs_provider_reads_local_cpulist() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("local_cpulist"), "4-7\n").unwrap();
        let device = dir.path().join("0000:3b:00.0");
        std::fs::create_dir(&device).unwrap();

        // The attribute is found on the parent of the device node.
        let hints = SysfsHintProvider
            .topology_hints(device.to_str().unwrap())
            .unwrap();
        assert_eq!(
            hints,
            vec![TopologyHint {
                cpus: "4-7".to_string()
            }]
        );
    }

    #[test]
    fn test_sysfs_provider_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = SysfsHintProvider.topology_hints(dir.path().to_str().unwrap());
        assert!(matches!(result, Err(HintError::NotFound { .. })));
    }
}
