//! Server version parsing and comparison.
//!
//! Versions have the form `MAJOR.MINOR.PATCH[-LABEL]`, e.g. `4.4.0`, `5.1.0` or
//! `5.0.0-rc1`. Ordering and equality look at `(major, minor, patch)` only: a
//! pre-release and the release of the same number compare equal.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{HarnessError, HarnessResult};

static VERSION_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?<major>\d)\.(?<minor>\d)\.(?<patch>\d+)(?<label>-.*)?").expect("valid regex")
});

// Tags carry edition suffixes after the number; only pre-release markers count as labels.
static TAG_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?<major>\d)\.(?<minor>\d)\.(?<patch>\d+)(?<label>-(?:alpha|beta|rc|drop)\d+)?")
        .expect("valid regex")
});

/// A server version.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    /// Major version.
    pub major: u32,
    /// Minor version.
    pub minor: u32,
    /// Patch version.
    pub patch: u32,
    /// Pre-release label including its leading `-`, empty for releases.
    pub label: String,
}

/// 4.0.0, the first release with multiple databases.
pub const V4_0_0: Version = Version::new(4, 0, 0);
/// 4.4.0, the first release supported on ARM.
pub const V4_4_0: Version = Version::new(4, 4, 0);
/// 5.0.0
pub const V5_0_0: Version = Version::new(5, 0, 0);

impl Version {
    /// Create a release version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
            label: String::new(),
        }
    }

    /// Create a version with a pre-release label, e.g. `"-rc1"`.
    #[must_use]
    pub fn with_label(major: u32, minor: u32, patch: u32, label: impl Into<String>) -> Self {
        Self {
            major,
            minor,
            patch,
            label: label.into(),
        }
    }

    /// Parse a version string. The whole input must match.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::MalformedVersion`] if the input is not a version.
    pub fn parse(input: &str) -> HarnessResult<Self> {
        let caps = VERSION_PATTERN
            .captures(input)
            .filter(|caps| caps.get(0).is_some_and(|m| m.as_str() == input))
            .ok_or_else(|| HarnessError::MalformedVersion {
                input: input.to_string(),
            })?;
        Self::from_captures(input, &caps)
    }

    /// Find a version inside an image reference such as `neo4j:5.1.0-enterprise`.
    ///
    /// Only a pre-release marker such as `-rc1` becomes the label; edition
    /// suffixes like `-enterprise` are dropped.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::MalformedVersion`] if no version appears in the tag.
    pub fn from_image_tag(tag: &str) -> HarnessResult<Self> {
        let caps = TAG_PATTERN
            .captures(tag)
            .ok_or_else(|| HarnessError::MalformedVersion {
                input: tag.to_string(),
            })?;
        Self::from_captures(tag, &caps)
    }

    fn from_captures(input: &str, caps: &regex::Captures<'_>) -> HarnessResult<Self> {
        let number = |name: &str| -> HarnessResult<u32> {
            caps[name].parse().map_err(|_| HarnessError::MalformedVersion {
                input: input.to_string(),
            })
        };
        Ok(Self {
            major: number("major")?,
            minor: number("minor")?,
            patch: number("patch")?,
            label: caps
                .name("label")
                .map(|m| m.as_str().to_string())
                .unwrap_or_default(),
        })
    }

    const fn triple(&self) -> (u32, u32, u32) {
        (self.major, self.minor, self.patch)
    }

    /// True iff `self` is strictly newer than `that`. Labels are ignored.
    #[must_use]
    pub fn is_newer_than(&self, that: &Self) -> bool {
        self.triple() > that.triple()
    }

    /// True iff `self` is not at least `that`.
    #[must_use]
    pub fn is_older_than(&self, that: &Self) -> bool {
        !self.is_at_least(that)
    }

    /// True iff `self` is newer than or equal to `that`.
    #[must_use]
    pub fn is_at_least(&self, that: &Self) -> bool {
        self.is_newer_than(that) || self.is_equal(that)
    }

    /// True iff major, minor and patch all match.
    #[must_use]
    pub fn is_equal(&self, that: &Self) -> bool {
        self.triple() == that.triple()
    }

    /// `"{major}.{minor}"`, used to key branch-specific fixtures.
    #[must_use]
    pub fn branch(&self) -> String {
        format!("{}.{}", self.major, self.minor)
    }

    /// True for a pre-release build.
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        !self.label.is_empty()
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.is_equal(other)
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.triple().hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}{}", self.major, self.minor, self.patch, self.label)
    }
}

impl FromStr for Version {
    type Err = HarnessError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Version {
    type Error = HarnessError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.to_string()
    }
}
