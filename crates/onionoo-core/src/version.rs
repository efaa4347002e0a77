//! Tor software versions.
//!
//! Versions look like `0.4.8.9`, `0.4.9.1-alpha` or `0.3.5.7-rc-dev`. Up to
//! four numeric components are kept, plus an optional status tag taken from
//! the text after the first `-` up to the next space. Partial versions such as
//! `0.4` parse too, so that query prefixes and indexed versions share one type.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A parsed Tor version.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TorVersion {
    numbers: Vec<u32>,
    status_tag: Option<String>,
}

/// Error returned when a string is not a Tor version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseVersionError(String);

impl fmt::Display for ParseVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "not a tor version: '{}'", self.0)
    }
}

impl std::error::Error for ParseVersionError {}

impl TorVersion {
    /// Numeric components, at most four
    pub fn numbers(&self) -> &[u32] {
        &self.numbers
    }

    /// Status tag such as "alpha" or "rc"
    pub fn status_tag(&self) -> Option<&str> {
        self.status_tag.as_deref()
    }

    /// Whether one version's components are a prefix of the other's.
    ///
    /// `0.4` matches `0.4.8.9` and vice versa. Status tags only have to agree
    /// when both sides carry one.
    pub fn matches_prefix(&self, other: &TorVersion) -> bool {
        let common = self.numbers.len().min(other.numbers.len());
        if self.numbers[..common] != other.numbers[..common] {
            return false;
        }
        match (&self.status_tag, &other.status_tag) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

impl FromStr for TorVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseVersionError(s.to_string());
        let (numeric, tag) = match s.split_once('-') {
            Some((numeric, rest)) => (numeric, rest.split(' ').next()),
            None => (s, None),
        };

        let components: Vec<&str> = numeric.split('.').collect();
        let mut numbers = Vec::with_capacity(4);
        for (position, component) in components.iter().enumerate().take(4) {
            if component.is_empty() {
                // A trailing dot is tolerated; a leading or inner blank is not.
                if position == 0 || position < components.len() - 1 {
                    return Err(err());
                }
                continue;
            }
            numbers.push(component.parse::<u32>().map_err(|_| err())?);
        }
        if numbers.is_empty() {
            return Err(err());
        }

        Ok(TorVersion {
            numbers,
            status_tag: tag.filter(|t| !t.is_empty()).map(str::to_string),
        })
    }
}

impl Ord for TorVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        for (a, b) in self.numbers.iter().zip(other.numbers.iter()) {
            match a.cmp(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        match self.numbers.len().cmp(&other.numbers.len()) {
            Ordering::Equal => {}
            unequal => return unequal,
        }
        match (&self.status_tag, &other.status_tag) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(a), Some(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for TorVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TorVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (position, number) in self.numbers.iter().enumerate() {
            if position > 0 {
                write!(f, ".")?;
            }
            write!(f, "{}", number)?;
        }
        if let Some(tag) = &self.status_tag {
            write!(f, "-{}", tag)?;
        }
        Ok(())
    }
}

/// One element of a `version` query: a prefix, or an inclusive range whose
/// bounds are themselves prefixes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSpec {
    Prefix(TorVersion),
    Range {
        from: Option<TorVersion>,
        to: Option<TorVersion>,
    },
}

impl VersionSpec {
    /// Whether `version` satisfies this spec.
    pub fn matches(&self, version: &TorVersion) -> bool {
        match self {
            VersionSpec::Prefix(prefix) => prefix.matches_prefix(version),
            VersionSpec::Range { from, to } => {
                let above = from
                    .as_ref()
                    .map_or(true, |lo| version >= lo || lo.matches_prefix(version));
                let below = to
                    .as_ref()
                    .map_or(true, |hi| version <= hi || hi.matches_prefix(version));
                above && below
            }
        }
    }
}

impl FromStr for VersionSpec {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once("..") {
            None => Ok(VersionSpec::Prefix(s.parse()?)),
            Some((from, to)) => {
                if from.is_empty() && to.is_empty() {
                    return Err(ParseVersionError(s.to_string()));
                }
                let from = (!from.is_empty()).then(|| from.parse()).transpose()?;
                let to = (!to.is_empty()).then(|| to.parse()).transpose()?;
                Ok(VersionSpec::Range { from, to })
            }
        }
    }
}
