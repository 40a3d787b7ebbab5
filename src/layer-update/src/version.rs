//! Ordered version identifiers.

use std::cmp::Ordering;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{UpdateError, UpdateResult};

/// A version identifier as published in manifests.
///
/// Accepts dotted numeric versions (`1.4.2`), an optional `v` prefix and an
/// optional `-prerelease` suffix. A bare integer such as an Android version
/// code (`42`) is valid and compares as `42.0.0`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    raw: String,
    major: u64,
    minor: u64,
    patch: u64,
    prerelease: String,
}

impl Version {
    /// Parse a version string.
    pub fn parse(version: &str) -> UpdateResult<Self> {
        let raw = version.trim();
        let invalid = || UpdateError::InvalidVersion {
            version: version.to_string(),
        };

        // Remove 'v' prefix if present
        let stripped = raw.strip_prefix('v').unwrap_or(raw);

        // Split by '-' to separate prerelease
        let (version_part, prerelease) = stripped
            .split_once('-')
            .map(|(v, p)| (v, p.to_string()))
            .unwrap_or((stripped, String::new()));

        let mut parts = [0u64; 3];
        let mut count = 0;
        for segment in version_part.split('.') {
            if count == parts.len() {
                return Err(invalid());
            }
            parts[count] = segment.parse().map_err(|_| invalid())?;
            count += 1;
        }

        Ok(Self {
            raw: raw.to_string(),
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            prerelease,
        })
    }

    /// The version exactly as published.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    fn core(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }
}

/// Dot-separated identifiers: numeric ones compare numerically and sort
/// before alphanumeric ones, and a longer list wins when all shared
/// identifiers are equal. No prerelease sorts after any prerelease.
fn compare_prerelease(a: &str, b: &str) -> Ordering {
    match (a.is_empty(), b.is_empty()) {
        (true, true) => return Ordering::Equal,
        (true, false) => return Ordering::Greater,
        (false, true) => return Ordering::Less,
        (false, false) => {}
    }

    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        let ordering = match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => match (l.parse::<u64>(), r.parse::<u64>()) {
                (Ok(ln), Ok(rn)) => ln.cmp(&rn).then_with(|| l.cmp(r)),
                (Ok(_), Err(_)) => Ordering::Less,
                (Err(_), Ok(_)) => Ordering::Greater,
                (Err(_), Err(_)) => l.cmp(r),
            },
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.core()
            .cmp(&other.core())
            .then_with(|| compare_prerelease(&self.prerelease, &other.prerelease))
    }
}

impl FromStr for Version {
    type Err = UpdateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = UpdateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.raw
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}
