//! # CPU Sets
//!
//! Dense sets of hardware-thread ids with set algebra and the kernel's
//! range-compact text form.
//!
//! CPU ids are small non-negative integers, so sets are stored as packed
//! bit words. All set-algebra operations return fresh values; the inputs
//! are never mutated.
//!
//! ## Usage
//!
//! ```rust
//! use lattice_core::cpuset::CpuSet;
//!
//! let a: CpuSet = "0-3,8".parse().unwrap();
//! let b: CpuSet = (2..6).collect();
//! assert_eq!(a.intersection(&b).to_string(), "2-3");
//! ```

use std::fmt;
use std::str::FromStr;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

/// Identifier of a hardware thread as seen by the OS scheduler.
pub type Cpu = usize;

const WORD_BITS: usize = 64;

/// Errors from parsing the range-compact CPU list notation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CpuSetError {
    /// A list element is not a valid CPU id.
    #[error("invalid CPU id {0:?}")]
    InvalidCpu(String),

    /// A range has a start greater than its end.
    #[error("invalid CPU range {0:?}")]
    InvalidRange(String),
}

/// An unordered set of CPUs.
///
/// Supports union/intersection/difference, ascending listing, and the
/// range-compact text form used by sysfs cpulist attributes
/// (`0-3,8,10-11`). The empty set formats as the empty string.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet {
    // Bit words, trailing zero words trimmed so that Eq/Hash see one
    // canonical representation per set.
    words: SmallVec<[u64; 4]>,
}

impl CpuSet {
    /// Creates an empty CPU set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set holding a single CPU.
    #[must_use]
    pub fn single(cpu: Cpu) -> Self {
        let mut set = Self::new();
        set.insert(cpu);
        set
    }

    /// Adds a CPU to the set.
    pub fn insert(&mut self, cpu: Cpu) {
        let word = cpu / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (cpu % WORD_BITS);
    }

    /// Returns true if `cpu` is in the set.
    #[must_use]
    pub fn contains(&self, cpu: Cpu) -> bool {
        self.words
            .get(cpu / WORD_BITS)
            .is_some_and(|word| word >> (cpu % WORD_BITS) & 1 == 1)
    }

    /// Returns the number of CPUs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.words.iter().map(|word| word.count_ones() as usize).sum()
    }

    /// Returns true if the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&word| word == 0)
    }

    /// Returns the smallest CPU in the set, if any.
    #[must_use]
    pub fn first(&self) -> Option<Cpu> {
        self.iter().next()
    }

    /// Returns the union of two sets as a fresh set.
    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        let (long, short) = if self.words.len() >= other.words.len() {
            (self, other)
        } else {
            (other, self)
        };
        let mut words = long.words.clone();
        for (dst, src) in words.iter_mut().zip(&short.words) {
            *dst |= src;
        }
        Self { words }
    }

    /// Returns the intersection of two sets as a fresh set.
    #[must_use]
    pub fn intersection(&self, other: &Self) -> Self {
        let mut words: SmallVec<[u64; 4]> = self
            .words
            .iter()
            .zip(&other.words)
            .map(|(a, b)| a & b)
            .collect();
        trim(&mut words);
        Self { words }
    }

    /// Returns the CPUs of `self` that are not in `other` as a fresh set.
    #[must_use]
    pub fn difference(&self, other: &Self) -> Self {
        let mut words = self.words.clone();
        for (dst, src) in words.iter_mut().zip(&other.words) {
            *dst &= !src;
        }
        trim(&mut words);
        Self { words }
    }

    /// Iterates over the CPUs in ascending order.
    #[must_use]
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            words: &self.words,
            word: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Returns the CPUs in ascending order.
    #[must_use]
    pub fn list(&self) -> Vec<Cpu> {
        self.iter().collect()
    }

    /// Returns the CPUs in unspecified order.
    ///
    /// Callers must not depend on the order; use [`list`](Self::list) when
    /// the order matters.
    #[must_use]
    pub fn unsorted_list(&self) -> Vec<Cpu> {
        self.iter().collect()
    }
}

fn trim(words: &mut SmallVec<[u64; 4]>) {
    while words.last() == Some(&0) {
        words.pop();
    }
}

/// Iterator over the CPUs of a [`CpuSet`] in ascending order.
#[derive(Debug, Clone)]
pub struct Iter<'a> {
    words: &'a [u64],
    word: usize,
    current: u64,
}

impl Iterator for Iter<'_> {
    type Item = Cpu;

    fn next(&mut self) -> Option<Cpu> {
        while self.current == 0 {
            self.word += 1;
            self.current = *self.words.get(self.word)?;
        }
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.word * WORD_BITS + bit)
    }
}

impl<'a> IntoIterator for &'a CpuSet {
    type Item = Cpu;
    type IntoIter = Iter<'a>;

    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}

impl FromIterator<Cpu> for CpuSet {
    fn from_iter<I: IntoIterator<Item = Cpu>>(cpus: I) -> Self {
        let mut set = Self::new();
        for cpu in cpus {
            set.insert(cpu);
        }
        set
    }
}

impl Extend<Cpu> for CpuSet {
    fn extend<I: IntoIterator<Item = Cpu>>(&mut self, cpus: I) {
        for cpu in cpus {
            self.insert(cpu);
        }
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.iter().peekable();
        let mut first = true;
        while let Some(start) = iter.next() {
            let mut end = start;
            while let Some(&next) = iter.peek() {
                if next != end + 1 {
                    break;
                }
                end = next;
                iter.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuSet({self})")
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetError;

    /// Parses the range-compact notation, e.g. `0-3,8,10-11`.
    ///
    /// The empty string parses to the empty set. Stray commas are
    /// tolerated, matching the lenient kernel cpulist readers.
    fn from_str(s: &str) -> Result<Self, CpuSetError> {
        let mut set = Self::new();
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: Cpu = lo
                    .trim()
                    .parse()
                    .map_err(|_| CpuSetError::InvalidCpu(lo.trim().to_string()))?;
                let hi: Cpu = hi
                    .trim()
                    .parse()
                    .map_err(|_| CpuSetError::InvalidCpu(hi.trim().to_string()))?;
                if lo > hi {
                    return Err(CpuSetError::InvalidRange(part.to_string()));
                }
                set.extend(lo..=hi);
            } else {
                set.insert(
                    part.parse()
                        .map_err(|_| CpuSetError::InvalidCpu(part.to_string()))?,
                );
            }
        }
        Ok(set)
    }
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}
