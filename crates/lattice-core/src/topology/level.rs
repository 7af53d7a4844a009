//! Topology levels, ordered from the whole system down to a single
//! hardware thread.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of topology levels.
pub const LEVEL_COUNT: usize = 7;

/// A level of the CPU topology hierarchy.
///
/// Levels are ordered coarsest to finest; a deeper level compares greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TopologyLevel {
    /// The whole system.
    System,
    /// A physical CPU package (socket).
    Package,
    /// A die within a package.
    Die,
    /// A NUMA node.
    Numa,
    /// A level-2 cache shared by a group of cores.
    L2Cache,
    /// A physical core.
    Core,
    /// A hardware thread.
    Thread,
}

impl TopologyLevel {
    /// All levels, coarsest first.
    pub const ALL: [TopologyLevel; LEVEL_COUNT] = [
        TopologyLevel::System,
        TopologyLevel::Package,
        TopologyLevel::Die,
        TopologyLevel::Numa,
        TopologyLevel::L2Cache,
        TopologyLevel::Core,
        TopologyLevel::Thread,
    ];

    /// Numeric value of the level; deeper levels are larger.
    #[must_use]
    pub const fn value(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TopologyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::System => "system",
            Self::Package => "package",
            Self::Die => "die",
            Self::Numa => "numa",
            Self::L2Cache => "l2cache",
            Self::Core => "core",
            Self::Thread => "thread",
        };
        write!(f, "{name}")
    }
}

/// Error from parsing an unknown topology level name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown topology level {0:?}")]
pub struct ParseLevelError(String);

impl FromStr for TopologyLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, ParseLevelError> {
        match s.to_ascii_lowercase().as_str() {
            "system" => Ok(Self::System),
            "package" => Ok(Self::Package),
            "die" => Ok(Self::Die),
            "numa" => Ok(Self::Numa),
            "l2cache" => Ok(Self::L2Cache),
            "core" => Ok(Self::Core),
            "thread" => Ok(Self::Thread),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

impl Serialize for TopologyLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TopologyLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
