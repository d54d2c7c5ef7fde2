//! Release Version Parsing
//!
//! Strict `vMAJOR.MINOR.PATCH` versions with numeric precedence.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid version '{0}': expected vMAJOR.MINOR.PATCH")]
pub struct VersionParseError(pub String);

/// A release version. Ordering is numeric on (major, minor, patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    /// "Never updated"
    pub const SENTINEL: Version = Version::new(0, 0, 0);

    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    pub fn parse(raw: &str) -> Result<Self, VersionParseError> {
        let invalid = || VersionParseError(raw.to_string());

        let rest = raw.strip_prefix('v').ok_or_else(invalid)?;
        let mut parts = rest.split('.');
        let mut next = || -> Result<u64, VersionParseError> {
            let part = parts.next().ok_or_else(invalid)?;
            // Digits only: rejects signs, whitespace and empty components.
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            part.parse().map_err(|_| invalid())
        };

        let major = next()?;
        let minor = next()?;
        let patch = next()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(Self::new(major, minor, patch))
    }

    pub fn is_sentinel(&self) -> bool {
        *self == Self::SENTINEL
    }

    /// Strictly newer than `other`.
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::SENTINEL
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}
