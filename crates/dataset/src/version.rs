//! Dataset version arithmetic.
//!
//! Versions are dotted `major.minor.patch` triplets compared numerically
//! component by component. Increments use a fixed base-10 carry: patch and
//! minor live in `[0, 9]`, major is unbounded.

use crate::errors::{DatasetError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Patch and minor components carry into the next component at this value.
pub const ROLLOVER: u64 = 10;

/// Version handed out for the first snapshot of a dataset, and the sentinel
/// returned by [`latest_version`] when nothing exists yet.
pub const INITIAL_VERSION: DatasetVersion = DatasetVersion::new(1, 0, 0);

/// A `major.minor.patch` dataset version.
///
/// Field order matters: the derived `Ord` compares major, then minor, then patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DatasetVersion {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl DatasetVersion {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// The version following `self` under base-10 carry.
    ///
    /// Components already above the rollover (hand-made folders such as
    /// `1.0.15`) carry as well, so the result is always strictly greater.
    pub fn increment(&self) -> Self {
        let mut major = self.major;
        let mut minor = self.minor;
        let mut patch = self.patch + 1;

        if patch >= ROLLOVER {
            patch = 0;
            minor += 1;
        }
        if minor >= ROLLOVER {
            minor = 0;
            major += 1;
        }

        Self::new(major, minor, patch)
    }
}

impl Default for DatasetVersion {
    fn default() -> Self {
        INITIAL_VERSION
    }
}

impl fmt::Display for DatasetVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for DatasetVersion {
    type Err = DatasetError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return Err(DatasetError::InvalidVersion(s.to_string()));
        }

        let mut nums = [0u64; 3];
        for (slot, part) in nums.iter_mut().zip(parts.iter()) {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(DatasetError::InvalidVersion(s.to_string()));
            }
            *slot = part
                .parse()
                .map_err(|_| DatasetError::InvalidVersion(s.to_string()))?;
        }

        Ok(Self::new(nums[0], nums[1], nums[2]))
    }
}

impl Serialize for DatasetVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for DatasetVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Parse every well-formed version name, silently skipping the rest.
pub fn parse_versions<I, S>(names: I) -> Vec<DatasetVersion>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter_map(|name| name.as_ref().parse().ok())
        .collect()
}

/// Compute the next version for a dataset given the folder names on disk.
///
/// Empty (or entirely malformed) input yields `1.0.0`.
pub fn next_version<I, S>(existing: I) -> DatasetVersion
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parse_versions(existing)
        .into_iter()
        .max()
        .map(|latest| latest.increment())
        .unwrap_or(INITIAL_VERSION)
}

/// Greatest existing version, or `1.0.0` when there is none.
///
/// The fallback is a sentinel: it does not imply that a `1.0.0` folder exists.
pub fn latest_version<I, S>(existing: I) -> DatasetVersion
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    parse_versions(existing)
        .into_iter()
        .max()
        .unwrap_or(INITIAL_VERSION)
}

/// Order two version strings semantically.
///
/// Well-formed versions sort before malformed ones; malformed strings fall
/// back to plain string order among themselves.
pub fn compare_version_strings(a: &str, b: &str) -> Ordering {
    match (a.parse::<DatasetVersion>(), b.parse::<DatasetVersion>()) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}
