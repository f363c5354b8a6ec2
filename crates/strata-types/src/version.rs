//! Versions and version ranges
//!
//! Unit and feature versions follow the `major.minor.micro.qualifier` layout
//! used by modular runtimes. They are mapped onto [`semver::Version`] with the
//! qualifier carried as the pre-release tag, so `1.2.0.SNAPSHOT` and
//! `1.2.0-SNAPSHOT` parse to the same version.

use semver::{Prerelease, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Version parsing errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version: {0}")]
    Invalid(String),

    #[error("invalid version range: {0}")]
    InvalidRange(String),

    #[error("unknown range policy: {0}")]
    UnknownPolicy(String),
}

/// Parse a version leniently
///
/// Missing segments default to zero and an empty string is `0.0.0`.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Version::new(0, 0, 0));
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (numeric, tail) = trimmed.split_at(split);
    let numeric = numeric.trim_end_matches('.');
    if numeric.is_empty() {
        return Err(VersionError::Invalid(input.to_string()));
    }

    let mut segments = numeric.split('.');
    let mut numbers = [0u64; 3];
    for slot in numbers.iter_mut() {
        match segments.next() {
            Some(segment) => {
                *slot = segment
                    .parse()
                    .map_err(|_| VersionError::Invalid(input.to_string()))?;
            }
            None => break,
        }
    }

    // A fourth numeric segment is a qualifier of its own
    let mut qualifier: Vec<&str> = segments.collect();
    let tail = tail.trim_start_matches(['-', '.']);
    if !tail.is_empty() {
        qualifier.push(tail);
    }

    let mut version = Version::new(numbers[0], numbers[1], numbers[2]);
    if !qualifier.is_empty() {
        version.pre = qualifier_to_prerelease(&qualifier.join("."))
            .ok_or_else(|| VersionError::Invalid(input.to_string()))?;
    }
    Ok(version)
}

fn qualifier_to_prerelease(qualifier: &str) -> Option<Prerelease> {
    let identifiers: Vec<String> = qualifier
        .split('.')
        .map(|ident| {
            let cleaned: String = ident
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
                .collect();
            if cleaned.is_empty() {
                "0".to_string()
            } else if cleaned.len() > 1
                && cleaned.starts_with('0')
                && cleaned.chars().all(|c| c.is_ascii_digit())
            {
                // numeric identifiers may not carry leading zeros
                format!("0-{}", cleaned)
            } else {
                cleaned
            }
        })
        .collect();
    Prerelease::new(&identifiers.join(".")).ok()
}

/// The lowest version with the given major and minor numbers
fn lowest(major: u64, minor: u64) -> Version {
    let mut version = Version::new(major, minor, 0);
    version.pre = Prerelease::new("0").unwrap_or(Prerelease::EMPTY);
    version
}

/// An interval of versions
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    pub floor: Version,
    pub floor_inclusive: bool,
    /// `None` means unbounded
    pub ceiling: Option<Version>,
    pub ceiling_inclusive: bool,
}

impl VersionRange {
    /// Every version
    pub fn any() -> Self {
        Self::at_least(Version::new(0, 0, 0))
    }

    /// `[version, ∞)`
    pub fn at_least(version: Version) -> Self {
        Self {
            floor: version,
            floor_inclusive: true,
            ceiling: None,
            ceiling_inclusive: false,
        }
    }

    /// `[version, version]`
    pub fn exact(version: Version) -> Self {
        Self {
            floor: version.clone(),
            floor_inclusive: true,
            ceiling: Some(version),
            ceiling_inclusive: true,
        }
    }

    /// Parse interval notation (`[1,2)`, `(1.0,2.0]`) or a bare version
    /// meaning "at least"
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let trimmed = input.trim();
        let invalid = || VersionError::InvalidRange(input.to_string());

        let first = trimmed.chars().next();
        if !matches!(first, Some('[') | Some('(')) {
            return parse_version(trimmed)
                .map(Self::at_least)
                .map_err(|_| invalid());
        }

        let last = trimmed.chars().last().ok_or_else(invalid)?;
        if !matches!(last, ']' | ')') || trimmed.len() < 2 {
            return Err(invalid());
        }
        let body = &trimmed[1..trimmed.len() - 1];
        let (low, high) = body.split_once(',').ok_or_else(invalid)?;

        let floor = parse_version(low).map_err(|_| invalid())?;
        let ceiling = parse_version(high).map_err(|_| invalid())?;
        if ceiling < floor {
            return Err(invalid());
        }

        Ok(Self {
            floor,
            floor_inclusive: first == Some('['),
            ceiling: Some(ceiling),
            ceiling_inclusive: last == ']',
        })
    }

    /// Whether the range accepts every version
    pub fn is_any(&self) -> bool {
        self.ceiling.is_none() && self.floor_inclusive && self.floor == Version::new(0, 0, 0)
    }

    pub fn contains(&self, version: &Version) -> bool {
        let above_floor = if self.floor_inclusive {
            version >= &self.floor
        } else {
            version > &self.floor
        };
        if !above_floor {
            return false;
        }
        match &self.ceiling {
            None => true,
            Some(ceiling) if self.ceiling_inclusive => version <= ceiling,
            Some(ceiling) => version < ceiling,
        }
    }
}

impl Default for VersionRange {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.ceiling {
            None if self.floor_inclusive => write!(f, "{}", self.floor),
            None => write!(f, "({},)", self.floor),
            Some(ceiling) => write!(
                f,
                "{}{},{}{}",
                if self.floor_inclusive { '[' } else { '(' },
                self.floor,
                ceiling,
                if self.ceiling_inclusive { ']' } else { ')' }
            ),
        }
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = VersionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<VersionRange> for String {
    fn from(range: VersionRange) -> Self {
        range.to_string()
    }
}

/// How far a version may move and still be considered "the same" unit or feature
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RangePolicy {
    /// Only the exact version
    Exact,
    /// Any version sharing major and minor numbers
    #[default]
    SameMinor,
    /// Any version sharing the major number
    SameMajor,
    /// Any version at all
    Any,
}

impl RangePolicy {
    /// The range around `version` accepted by this policy
    pub fn range_for(&self, version: &Version) -> VersionRange {
        match self {
            Self::Exact => VersionRange::exact(version.clone()),
            Self::SameMinor => VersionRange {
                floor: lowest(version.major, version.minor),
                floor_inclusive: true,
                ceiling: Some(lowest(version.major, version.minor + 1)),
                ceiling_inclusive: false,
            },
            Self::SameMajor => VersionRange {
                floor: lowest(version.major, 0),
                floor_inclusive: true,
                ceiling: Some(lowest(version.major + 1, 0)),
                ceiling_inclusive: false,
            },
            Self::Any => VersionRange::any(),
        }
    }
}

impl FromStr for RangePolicy {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "exact" => Ok(Self::Exact),
            "same-minor" | "minor" => Ok(Self::SameMinor),
            "same-major" | "major" => Ok(Self::SameMajor),
            "any" => Ok(Self::Any),
            other => Err(VersionError::UnknownPolicy(other.to_string())),
        }
    }
}

impl fmt::Display for RangePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Exact => "exact",
            Self::SameMinor => "same-minor",
            Self::SameMajor => "same-major",
            Self::Any => "any",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        parse_version(s).unwrap()
    }

    #[test]
    fn test_parse_lenient_versions() {
        assert_eq!(v("1"), Version::new(1, 0, 0));
        assert_eq!(v("1.2"), Version::new(1, 2, 0));
        assert_eq!(v(""), Version::new(0, 0, 0));
        assert_eq!(v("1.2.3.SNAPSHOT"), v("1.2.3-SNAPSHOT"));
        assert_eq!(v("1.2.3.SNAPSHOT").pre.as_str(), "SNAPSHOT");
        assert_eq!(v("1.0.0.001").pre.as_str(), "0-001");
        assert!(parse_version("abc").is_err());
    }

    #[test]
    fn test_range_parse_and_contains() {
        let range = VersionRange::parse("[1,2)").unwrap();
        assert!(range.contains(&v("1.0.0")));
        assert!(range.contains(&v("1.9.9")));
        assert!(!range.contains(&v("2.0.0")));

        let open = VersionRange::parse("(1.0,2.0]").unwrap();
        assert!(!open.contains(&v("1.0.0")));
        assert!(open.contains(&v("2.0.0")));

        let bare = VersionRange::parse("1.5").unwrap();
        assert!(bare.contains(&v("7.0.0")));
        assert!(!bare.contains(&v("1.4.0")));

        assert!(VersionRange::parse("0.0.0").unwrap().is_any());
        assert!(VersionRange::parse("[2,1]").is_err());
        assert!(VersionRange::parse("[1,2").is_err());
    }

    #[test]
    fn test_range_display() {
        assert_eq!(VersionRange::exact(v("1.3.0")).to_string(), "[1.3.0,1.3.0]");
        assert_eq!(VersionRange::parse("[1,2)").unwrap().to_string(), "[1.0.0,2.0.0)");
        assert_eq!(VersionRange::any().to_string(), "0.0.0");
    }

    #[test]
    fn test_same_minor_policy_includes_snapshots_of_floor() {
        let range = RangePolicy::SameMinor.range_for(&v("1.2.5"));
        assert!(range.contains(&v("1.2.0")));
        assert!(range.contains(&v("1.2.0-SNAPSHOT")));
        assert!(range.contains(&v("1.2.9")));
        assert!(!range.contains(&v("1.3.0-SNAPSHOT")));
        assert!(!range.contains(&v("1.3.0")));
    }

    #[test]
    fn test_same_major_and_exact_policies() {
        let major = RangePolicy::SameMajor.range_for(&v("1.2.0"));
        assert!(major.contains(&v("1.0.0")));
        assert!(major.contains(&v("1.1.0")));
        assert!(!major.contains(&v("2.0.0")));

        let exact = RangePolicy::Exact.range_for(&v("1.2.0"));
        assert!(exact.contains(&v("1.2.0")));
        assert!(!exact.contains(&v("1.2.1")));
    }

    #[test]
    fn test_policy_from_str() {
        assert_eq!("same_major".parse::<RangePolicy>().unwrap(), RangePolicy::SameMajor);
        assert_eq!("Exact".parse::<RangePolicy>().unwrap(), RangePolicy::Exact);
        assert!("sideways".parse::<RangePolicy>().is_err());
    }
}
