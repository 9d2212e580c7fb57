//! Release records and version ordering.
//!
//! Tags are ordered by SemVer 2.0 precedence: numeric components compare
//! numerically, a pre-release sorts before its release, and pre-release
//! identifiers compare field by field (numeric fields numerically). A leading
//! `v` is accepted and ignored. Tags that do not parse as versions take no
//! part in version computation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use crate::validation::ValidationError;

/// Which version component a release increments
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BumpPolicy {
    /// `X.0.0`
    Major,
    /// `x.Y.0`
    Minor,
    /// `x.y.Z`
    #[default]
    Patch,
}

impl FromStr for BumpPolicy {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "patch" => Ok(Self::Patch),
            other => Err(ValidationError::InvalidInput {
                action: "tag-release".to_string(),
                input: "bump".to_string(),
                reason: format!("expected major, minor or patch, got '{other}'"),
            }),
        }
    }
}

impl fmt::Display for BumpPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Major => write!(f, "major"),
            Self::Minor => write!(f, "minor"),
            Self::Patch => write!(f, "patch"),
        }
    }
}

/// A parsed release version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version(semver::Version);

impl Version {
    /// Creates a plain `major.minor.patch` version
    #[must_use]
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self(semver::Version::new(major, minor, patch))
    }

    /// Parses a tag name such as `v1.2.3` or `1.0.0-rc.1`
    pub fn parse_tag(tag: &str) -> Option<Self> {
        let trimmed = tag.trim();
        let raw = trimmed
            .strip_prefix('v')
            .or_else(|| trimmed.strip_prefix('V'))
            .unwrap_or(trimmed);
        semver::Version::parse(raw).ok().map(Self)
    }

    /// Major component
    #[must_use]
    pub fn major(&self) -> u64 {
        self.0.major
    }

    /// Minor component
    #[must_use]
    pub fn minor(&self) -> u64 {
        self.0.minor
    }

    /// Patch component
    #[must_use]
    pub fn patch(&self) -> u64 {
        self.0.patch
    }

    /// Returns true for versions such as `1.0.0-rc.1`
    #[must_use]
    pub fn is_prerelease(&self) -> bool {
        !self.0.pre.is_empty()
    }

    /// Computes the next version under `policy`.
    ///
    /// A pre-release bumped by `patch` is finalized to its own release
    /// (`1.0.0-rc.1` becomes `1.0.0`); `minor` and `major` increment as usual.
    #[must_use]
    pub fn bump(&self, policy: BumpPolicy) -> Self {
        let v = &self.0;
        match policy {
            BumpPolicy::Patch if self.is_prerelease() => Self::new(v.major, v.minor, v.patch),
            BumpPolicy::Patch => Self::new(v.major, v.minor, v.patch + 1),
            BumpPolicy::Minor => Self::new(v.major, v.minor + 1, 0),
            BumpPolicy::Major => Self::new(v.major + 1, 0, 0),
        }
    }

    /// Renders the tag name for this version (`v` prefixed)
    #[must_use]
    pub fn tag(&self) -> String {
        format!("v{}", self.0)
    }

    /// Picks the highest version among `tags`, ignoring non-version tags
    pub fn highest<'a>(tags: impl IntoIterator<Item = &'a str>) -> Option<(String, Self)> {
        tags.into_iter()
            .filter_map(|tag| Self::parse_tag(tag).map(|v| (tag.to_string(), v)))
            .max_by(|(_, a), (_, b)| a.cmp(b))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Build metadata has no precedence; it only breaks ties so the order stays total.
        self.0
            .cmp_precedence(&other.0)
            .then_with(|| self.0.build.cmp(&other.0.build))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Version {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_tag(s).ok_or_else(|| ValidationError::Malformed {
            reason: format!("'{s}' is not a semantic version"),
        })
    }
}

impl TryFrom<String> for Version {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Version> for String {
    fn from(value: Version) -> Self {
        value.to_string()
    }
}

/// A tagged release; immutable once created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    /// Tag name, e.g. `v1.4.0`
    pub tag: String,
    /// Parsed version of the tag
    pub version: Version,
    /// Commit the tag points at
    pub commit: String,
    /// Generated release notes
    pub notes: String,
    /// Artifact references attached to the release
    #[serde(default)]
    pub artifacts: Vec<String>,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// Creates a release for `version` at `commit`
    #[must_use]
    pub fn new(version: Version, commit: impl Into<String>, notes: impl Into<String>) -> Self {
        Self {
            tag: version.tag(),
            version,
            commit: commit.into(),
            notes: notes.into(),
            artifacts: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Attaches artifact references
    #[must_use]
    pub fn with_artifacts(mut self, artifacts: Vec<String>) -> Self {
        self.artifacts = artifacts;
        self
    }
}
