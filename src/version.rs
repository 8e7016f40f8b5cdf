// ============================================================================
// VERSION RESOLVER
// ============================================================================
// Semantic versions extracted from server banners, plus explicit version
// ranges. Ranges are a conjunction of comparators rather than predicates so
// that overlap between override queries can be checked when tables load.
// ============================================================================

use std::cmp::Ordering;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, VersionParseError};

static BANNER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\w+ ((\d+)(\.\d+)?(\.\d+)?)").expect("banner regex is valid")
});

// ----------------------------------------------------------------------------
// Version
// ----------------------------------------------------------------------------

/// A `major.minor.patch` server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self { major, minor, patch }
    }

    /// Parse a version leniently.
    ///
    /// Accepts short forms (`10`, `9.6`) with missing parts defaulting to 0,
    /// a leading `v`, and trailing pre-release or build suffixes
    /// (`10beta1`, `9.6.1-rc1`, `11.2+build`).
    pub fn parse_tolerant(input: &str) -> Result<Self, VersionParseError> {
        let err = || VersionParseError {
            banner: input.to_string(),
        };

        let trimmed = input.trim();
        let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
        let numeric_len = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let numeric = trimmed[..numeric_len].trim_end_matches('.');
        if numeric.is_empty() {
            return Err(err());
        }

        let mut parts = [0u64; 3];
        for (slot, part) in parts.iter_mut().zip(numeric.split('.')) {
            *slot = part.parse().map_err(|_| err())?;
        }
        Ok(Self::new(parts[0], parts[1], parts[2]))
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_tolerant(s)
    }
}

/// Extract the server version from the output of `SELECT version()`.
///
/// `"PostgreSQL 9.6.1 on x86_64-pc-linux-gnu"` resolves to `9.6.1`.
pub fn parse_server_version(banner: &str) -> Result<Version, VersionParseError> {
    BANNER_RE
        .captures(banner)
        .and_then(|caps| caps.get(1))
        .ok_or_else(|| VersionParseError {
            banner: banner.to_string(),
        })
        .and_then(|m| Version::parse_tolerant(m.as_str()))
}

// ----------------------------------------------------------------------------
// Comparators & Ranges
// ----------------------------------------------------------------------------

/// Comparison operator of a single range bound
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Op {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
}

impl Op {
    fn symbol(&self) -> &'static str {
        match self {
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Eq => "=",
        }
    }
}

/// One bound of a version range, e.g. `>=9.2.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Comparator {
    pub op: Op,
    pub version: Version,
}

impl Comparator {
    pub const fn new(op: Op, version: Version) -> Self {
        Self { op, version }
    }

    pub fn matches(&self, v: &Version) -> bool {
        let ord = v.cmp(&self.version);
        match self.op {
            Op::Gt => ord == Ordering::Greater,
            Op::Ge => ord != Ordering::Less,
            Op::Lt => ord == Ordering::Less,
            Op::Le => ord != Ordering::Greater,
            Op::Eq => ord == Ordering::Equal,
        }
    }
}

impl Display for Comparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op.symbol(), self.version)
    }
}

impl FromStr for Comparator {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |message: &str| ConfigError::InvalidVersionRange {
            range: s.to_string(),
            message: message.to_string(),
        };

        let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
            (Op::Ge, rest)
        } else if let Some(rest) = s.strip_prefix("<=") {
            (Op::Le, rest)
        } else if let Some(rest) = s.strip_prefix('>') {
            (Op::Gt, rest)
        } else if let Some(rest) = s.strip_prefix('<') {
            (Op::Lt, rest)
        } else if let Some(rest) = s.strip_prefix('=') {
            (Op::Eq, rest)
        } else {
            (Op::Eq, s)
        };

        let version = Version::parse_tolerant(rest).map_err(|_| invalid("expected a version after the operator"))?;
        Ok(Self::new(op, version))
    }
}

/// A conjunction of comparators. An empty range matches every version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VersionRange {
    comparators: Vec<Comparator>,
}

impl VersionRange {
    /// Matches every version
    pub fn any() -> Self {
        Self::default()
    }

    /// `>=v`
    pub fn at_least(v: Version) -> Self {
        Self {
            comparators: vec![Comparator::new(Op::Ge, v)],
        }
    }

    /// `<v`
    pub fn below(v: Version) -> Self {
        Self {
            comparators: vec![Comparator::new(Op::Lt, v)],
        }
    }

    /// `>=lower <upper`
    pub fn between(lower: Version, upper: Version) -> Self {
        Self {
            comparators: vec![Comparator::new(Op::Ge, lower), Comparator::new(Op::Lt, upper)],
        }
    }

    pub fn from_comparators(comparators: Vec<Comparator>) -> Self {
        Self { comparators }
    }

    /// Parse a whitespace separated conjunction such as `">=9.2.0 <10.0.0"`.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let comparators = input
            .split_whitespace()
            .map(Comparator::from_str)
            .collect::<Result<Vec<_>, _>>()?;
        let range = Self { comparators };
        if range.interval().is_empty() {
            return Err(ConfigError::InvalidVersionRange {
                range: input.to_string(),
                message: "range can never match".into(),
            });
        }
        Ok(range)
    }

    pub fn comparators(&self) -> &[Comparator] {
        &self.comparators
    }

    pub fn matches(&self, v: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(v))
    }

    /// Whether some version satisfies both ranges.
    ///
    /// Versions are treated as a dense order, so `>9.6.0 <9.6.1` is
    /// considered satisfiable. That errs towards reporting overlaps.
    pub fn overlaps(&self, other: &VersionRange) -> bool {
        !self.interval().intersect(&other.interval()).is_empty()
    }

    fn interval(&self) -> Interval {
        self.comparators
            .iter()
            .fold(Interval::unbounded(), |acc, c| acc.intersect(&Interval::from(*c)))
    }
}

impl Display for VersionRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.comparators.is_empty() {
            return write!(f, "*");
        }
        for (i, c) in self.comparators.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", c)?;
        }
        Ok(())
    }
}

impl FromStr for VersionRange {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// ----------------------------------------------------------------------------
// Interval arithmetic for overlap checks
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl Interval {
    fn unbounded() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    fn intersect(&self, other: &Interval) -> Interval {
        let lower = match (self.lower, other.lower) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Greater => a,
                Ordering::Less => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };
        let upper = match (self.upper, other.upper) {
            (Some(a), Some(b)) => Some(match a.version.cmp(&b.version) {
                Ordering::Less => a,
                Ordering::Greater => b,
                Ordering::Equal => Bound {
                    version: a.version,
                    inclusive: a.inclusive && b.inclusive,
                },
            }),
            (a, b) => a.or(b),
        };
        Interval { lower, upper }
    }

    fn is_empty(&self) -> bool {
        match (self.lower, self.upper) {
            (Some(lo), Some(hi)) => match lo.version.cmp(&hi.version) {
                Ordering::Greater => true,
                Ordering::Equal => !(lo.inclusive && hi.inclusive),
                Ordering::Less => false,
            },
            _ => false,
        }
    }
}

impl From<Comparator> for Interval {
    fn from(c: Comparator) -> Self {
        let bound = |inclusive| {
            Some(Bound {
                version: c.version,
                inclusive,
            })
        };
        match c.op {
            Op::Gt => Interval { lower: bound(false), upper: None },
            Op::Ge => Interval { lower: bound(true), upper: None },
            Op::Lt => Interval { lower: None, upper: bound(false) },
            Op::Le => Interval { lower: None, upper: bound(true) },
            Op::Eq => Interval { lower: bound(true), upper: bound(true) },
        }
    }
}
