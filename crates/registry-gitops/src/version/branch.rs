use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use super::VersionError;

/// Branch that carries no version and sorts before every other branch.
pub const BASELINE_BRANCH: &str = "master";

const HEADS_PREFIX: &str = "refs/heads/";

/// A dotted version with an optional pre-release suffix.
///
/// Any number of numeric segments is accepted (`1.1.0.123.456`), missing
/// segments compare as zero, and build metadata after `+` is ignored for
/// ordering. The distinguished lowest version orders before all others.
#[derive(Debug, Clone)]
pub struct Version {
    segments: Vec<u64>,
    prerelease: Option<String>,
    original: String,
}

impl Version {
    /// Parses a version string, accepting an optional leading `v`.
    pub fn parse(input: &str) -> Result<Self, VersionError> {
        let invalid = |reason: &str| VersionError::InvalidVersion {
            input: input.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = input.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let body = match body.split_once('+') {
            Some((head, metadata)) => {
                if metadata.is_empty() {
                    return Err(invalid("empty build metadata"));
                }
                head
            }
            None => body,
        };

        let core_len = body
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(body.len());
        let (core, rest) = body.split_at(core_len);
        if core.is_empty() {
            return Err(invalid("missing numeric segments"));
        }

        let mut segments = Vec::new();
        for segment in core.split('.') {
            if segment.is_empty() {
                return Err(invalid("empty numeric segment"));
            }
            let value = segment
                .parse::<u64>()
                .map_err(|e| invalid(&format!("segment '{segment}': {e}")))?;
            segments.push(value);
        }

        let prerelease = if rest.is_empty() {
            None
        } else {
            let pre = rest.strip_prefix('-').unwrap_or(rest);
            if pre.is_empty() {
                return Err(invalid("empty pre-release"));
            }
            if !pre
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '~')
            {
                return Err(invalid("unexpected character in pre-release"));
            }
            Some(pre.to_string())
        };

        Ok(Self {
            segments,
            prerelease,
            original: trimmed.to_string(),
        })
    }

    /// The version that orders before every parseable version.
    pub fn lowest() -> Self {
        Self {
            segments: Vec::new(),
            prerelease: None,
            original: BASELINE_BRANCH.to_string(),
        }
    }

    pub fn is_lowest(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    pub fn prerelease(&self) -> Option<&str> {
        self.prerelease.as_deref()
    }

    /// Returns `true` when the leading segments of `self` equal every segment
    /// of `prefix`. Pre-release tags only take part when `prefix` carries one.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        if self.is_lowest() || prefix.is_lowest() {
            return self.is_lowest() && prefix.is_lowest();
        }
        let wanted = padded(&prefix.segments);
        let have = padded(&self.segments);
        if have.len() < wanted.len() || have[..wanted.len()] != wanted[..] {
            return false;
        }
        match &prefix.prerelease {
            Some(pre) => self.prerelease.as_deref() == Some(pre.as_str()),
            None => true,
        }
    }
}

/// Versions print with at least three segments, so `1.1` prefixes like `1.1.0`.
fn padded(segments: &[u64]) -> Vec<u64> {
    let mut out = segments.to_vec();
    while out.len() < 3 {
        out.push(0);
    }
    out
}

fn compare_segments(a: &[u64], b: &[u64]) -> Ordering {
    let len = a.len().max(b.len());
    for i in 0..len {
        let left = a.get(i).copied().unwrap_or(0);
        let right = b.get(i).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

fn compare_identifier(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

fn compare_prerelease(a: Option<&str>, b: Option<&str>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => {
            let mut left = a.split(['.', '-']);
            let mut right = b.split(['.', '-']);
            loop {
                match (left.next(), right.next()) {
                    (None, None) => return Ordering::Equal,
                    (None, Some(_)) => return Ordering::Less,
                    (Some(_), None) => return Ordering::Greater,
                    (Some(x), Some(y)) => match compare_identifier(x, y) {
                        Ordering::Equal => continue,
                        other => return other,
                    },
                }
            }
        }
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.is_lowest(), other.is_lowest()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            (false, false) => {}
        }
        compare_segments(&self.segments, &other.segments).then_with(|| {
            compare_prerelease(self.prerelease.as_deref(), other.prerelease.as_deref())
        })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.original)
    }
}

/// Version of a branch name. `master` and unparseable names map to the lowest version.
pub fn branch_version(name: &str) -> Version {
    if name == BASELINE_BRANCH {
        return Version::lowest();
    }
    Version::parse(name).unwrap_or_else(|_| Version::lowest())
}

/// Sorts branch names ascending by their version. Ties keep their input order.
pub fn sort_by_version(branches: &mut [String]) {
    branches.sort_by_cached_key(|name| branch_version(name));
}

/// The lowest version among `branches`, or the lowest version when empty.
pub fn lowest_version<S: AsRef<str>>(branches: &[S]) -> Version {
    branches
        .iter()
        .map(|b| branch_version(b.as_ref()))
        .min()
        .unwrap_or_else(Version::lowest)
}

/// Keeps local head references other than the baseline, returning bare branch names.
pub fn update_branches<S: AsRef<str>>(refs: &[S]) -> Vec<String> {
    refs.iter()
        .filter_map(|r| r.as_ref().strip_prefix(HEADS_PREFIX))
        .filter(|name| !name.is_empty() && *name != BASELINE_BRANCH)
        .map(str::to_string)
        .collect()
}
