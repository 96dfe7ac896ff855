use std::fmt;
use std::str::FromStr;

use regex::Regex;

use super::{Version, VersionError};

const FILTER_PATTERN: &str = r"^(<=|>=|==|>|<)(.+)$";

/// Comparison operator of a version filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `==`, a segment-prefix match.
    Equal,
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
}

impl Comparison {
    fn from_operator(op: &str) -> Option<Self> {
        match op {
            "==" => Some(Self::Equal),
            "<" => Some(Self::Less),
            "<=" => Some(Self::LessOrEqual),
            ">" => Some(Self::Greater),
            ">=" => Some(Self::GreaterOrEqual),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Equal => "==",
            Self::Less => "<",
            Self::LessOrEqual => "<=",
            Self::Greater => ">",
            Self::GreaterOrEqual => ">=",
        }
    }
}

/// Anything that may carry a version.
pub trait Versioned {
    fn version(&self) -> Option<&Version>;
}

impl Versioned for Version {
    fn version(&self) -> Option<&Version> {
        Some(self)
    }
}

impl Versioned for Option<Version> {
    fn version(&self) -> Option<&Version> {
        self.as_ref()
    }
}

/// Predicate over versions built from an expression like `>=1.3.0`.
///
/// An empty expression yields a permissive filter that accepts everything,
/// including entities without a version.
#[derive(Debug, Clone, Default)]
pub struct VersionFilter {
    bound: Option<(Comparison, Version)>,
}

impl VersionFilter {
    pub fn parse(pattern: &str) -> Result<Self, VersionError> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Ok(Self::permissive());
        }

        let invalid = |reason: String| VersionError::InvalidPattern {
            pattern: pattern.to_string(),
            reason,
        };

        let re = Regex::new(FILTER_PATTERN).map_err(|e| invalid(e.to_string()))?;
        let captures = re
            .captures(pattern)
            .ok_or_else(|| invalid("expected one of ==, <, <=, >, >= followed by a version".into()))?;

        let comparison = Comparison::from_operator(&captures[1])
            .ok_or_else(|| invalid(format!("unknown operator '{}'", &captures[1])))?;
        let version = Version::parse(&captures[2]).map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            bound: Some((comparison, version)),
        })
    }

    pub fn permissive() -> Self {
        Self { bound: None }
    }

    pub fn is_permissive(&self) -> bool {
        self.bound.is_none()
    }

    pub fn matches(&self, candidate: &Version) -> bool {
        let Some((comparison, bound)) = &self.bound else {
            return true;
        };
        // Versions sharing the bound's segments count as equal to it.
        let equal = candidate.starts_with(bound);
        match comparison {
            Comparison::Equal => equal,
            Comparison::Less => !equal && candidate < bound,
            Comparison::LessOrEqual => equal || candidate < bound,
            Comparison::Greater => !equal && candidate > bound,
            Comparison::GreaterOrEqual => equal || candidate > bound,
        }
    }

    /// Like [`matches`](Self::matches) but for entities that may lack a version.
    pub fn accepts<T: Versioned + ?Sized>(&self, item: &T) -> bool {
        match item.version() {
            Some(version) => self.matches(version),
            None => self.is_permissive(),
        }
    }

    /// Keeps the accepted items, preserving their order.
    pub fn filter<T: Versioned>(&self, items: Vec<T>) -> Vec<T> {
        items.into_iter().filter(|item| self.accepts(item)).collect()
    }
}

impl FromStr for VersionFilter {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.bound {
            Some((comparison, version)) => write!(f, "{}{}", comparison.as_str(), version),
            None => Ok(()),
        }
    }
}
