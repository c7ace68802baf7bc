//! `major.minor.patch` release versions with numeric ordering.
//!
//! Only final releases are published in version documents, so the grammar is
//! strictly numeric. Pre-release and local suffixes (`1.0.9rc1`,
//! `1.0.9-rc.1`, `1.0.9+local`) are rejected rather than ordered.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Release version; compares field by field, numerically.
///
/// Every field is a bare decimal number. A version carrying a pre-release
/// or local suffix fails to parse with [`VersionParseError::NotNumeric`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    /// Major field.
    pub major: u64,
    /// Minor field.
    pub minor: u64,
    /// Patch field.
    pub patch: u64,
}

/// Errors from [`Version::from_str`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("empty version string")]
    Empty,
    #[error("version '{0}' has more than three fields")]
    TooManyFields(String),
    #[error("version '{input}' has a non-numeric field '{field}'")]
    NotNumeric { input: String, field: String },
}

impl Version {
    /// Construct from fields.
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    /// Parse `1`, `1.2` or `1.2.3` (an optional leading `v` is accepted);
    /// missing trailing fields are zero.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('v').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(VersionParseError::Empty);
        }

        let mut fields = [0u64; 3];
        for (i, part) in body.split('.').enumerate() {
            if i >= fields.len() {
                return Err(VersionParseError::TooManyFields(s.to_owned()));
            }
            fields[i] = part.parse().map_err(|_| VersionParseError::NotNumeric {
                input: s.to_owned(),
                field: part.to_owned(),
            })?;
        }
        Ok(Self::new(fields[0], fields[1], fields[2]))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
