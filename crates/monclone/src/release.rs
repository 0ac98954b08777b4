//! Monitor release numbers.
//!
//! A release is the `major.minor` pair the API reports (`6.4`, parsed out
//! of strings like `"6.4.7"`). Patch levels never change API shape and are
//! discarded. The supported range is 4.0 through 7.0 inclusive.

use crate::error::PreconditionError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// A Monitor API release (`major.minor`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Release {
    pub major: u8,
    pub minor: u8,
}

impl Release {
    pub const R4_0: Release = Release { major: 4, minor: 0 };
    pub const R4_4: Release = Release { major: 4, minor: 4 };
    pub const R5_0: Release = Release { major: 5, minor: 0 };
    pub const R5_2: Release = Release { major: 5, minor: 2 };
    pub const R5_4: Release = Release { major: 5, minor: 4 };
    pub const R6_0: Release = Release { major: 6, minor: 0 };
    pub const R6_2: Release = Release { major: 6, minor: 2 };
    pub const R6_4: Release = Release { major: 6, minor: 4 };
    pub const R7_0: Release = Release { major: 7, minor: 0 };

    /// Every release with its own profile diff, oldest first.
    pub const ALL: [Release; 9] = [
        Release::R4_0,
        Release::R4_4,
        Release::R5_0,
        Release::R5_2,
        Release::R5_4,
        Release::R6_0,
        Release::R6_2,
        Release::R6_4,
        Release::R7_0,
    ];

    /// Parse `"6.4"` or `"6.4.7"`. Anything beyond the second segment is
    /// ignored.
    pub fn parse(text: &str) -> Result<Release, PreconditionError> {
        let mut parts = text.trim().split('.');
        let major = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(|| PreconditionError::UnsupportedRelease(text.to_string()))?;
        let minor = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(|| PreconditionError::UnsupportedRelease(text.to_string()))?;
        Ok(Release { major, minor })
    }

    /// Parse and reject releases outside the supported range.
    pub fn parse_supported(text: &str) -> Result<Release, PreconditionError> {
        let release = Release::parse(text)?;
        if !release.is_supported() {
            return Err(PreconditionError::UnsupportedRelease(text.to_string()));
        }
        Ok(release)
    }

    /// Whether this release falls inside the supported range.
    pub fn is_supported(self) -> bool {
        self >= Release::R4_0 && self <= Release::R7_0
    }
}

impl fmt::Display for Release {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl Serialize for Release {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Release {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Release::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_with_and_without_patch() {
        assert_eq!(Release::parse("6.4").unwrap(), Release::R6_4);
        assert_eq!(Release::parse("6.4.7").unwrap(), Release::R6_4);
        assert_eq!(Release::parse("4.0.30").unwrap(), Release::R4_0);
        assert!(Release::parse("banana").is_err());
        assert!(Release::parse("6").is_err());
    }

    #[test]
    fn ordering_is_numeric_not_lexical() {
        assert!(Release::R5_2 > Release::R5_0);
        assert!(Release::R7_0 > Release::R6_4);
        assert!(Release::parse("5.10").unwrap() > Release::R5_4);
    }

    #[test]
    fn supported_range_is_closed() {
        assert!(Release::R4_0.is_supported());
        assert!(Release::R7_0.is_supported());
        assert!(!Release::parse("3.4").unwrap().is_supported());
        assert!(!Release::parse("7.2").unwrap().is_supported());
    }

    #[test]
    fn serde_round_trip() {
        let json = serde_json::to_string(&Release::R6_2).unwrap();
        assert_eq!(json, "\"6.2\"");
        let back: Release = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Release::R6_2);
    }
}
