//! Remote API version compatibility.
//!
//! Versions are `major.minor.patch`. A server is compatible when its major
//! version equals ours and its minor version is at least ours; the patch
//! component is ignored.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

// ============================================================================
// Constants
// ============================================================================

/// API version this client speaks.
pub const API_VERSION: &str = "19.4.0";

// ============================================================================
// ApiVersion
// ============================================================================

/// A parsed `major.minor.patch` API version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    /// Breaking changes.
    pub major: u32,
    /// Backwards-compatible additions.
    pub minor: u32,
    /// Fixes only.
    pub patch: u32,
}

impl ApiVersion {
    /// Creates a version from its components.
    #[inline]
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Returns `true` if a server reporting `remote` can serve this client.
    #[inline]
    #[must_use]
    pub const fn accepts(&self, remote: &ApiVersion) -> bool {
        remote.major == self.major && remote.minor >= self.minor
    }
}

impl FromStr for ApiVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split('.');
        let mut component = || -> Result<u32> {
            parts
                .next()
                .ok_or_else(|| Error::protocol(format!("Malformed API version: {s:?}")))?
                .parse()
                .map_err(|_| Error::protocol(format!("Malformed API version: {s:?}")))
        };

        let version = Self::new(component()?, component()?, component()?);

        if parts.next().is_some() {
            return Err(Error::protocol(format!("Malformed API version: {s:?}")));
        }

        Ok(version)
    }
}

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

// ============================================================================
// Matching
// ============================================================================

/// Returns `true` if `remote` is compatible with `local`.
///
/// Unparseable versions never match.
#[must_use]
pub fn match_api_version(local: &str, remote: &str) -> bool {
    match (local.parse::<ApiVersion>(), remote.parse::<ApiVersion>()) {
        (Ok(local), Ok(remote)) => local.accepts(&remote),
        _ => false,
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use proptest::prelude::*;

    #[test]
    fn test_match_api_version() {
        assert!(match_api_version("2.1.0", "2.3.1"));
        assert!(match_api_version("2.1.0", "2.1.9"));
        assert!(!match_api_version("2.1.0", "3.0.0"));
        assert!(!match_api_version("2.1.0", "2.0.0"));
        assert!(!match_api_version("2.1.0", "1.9.0"));
    }

    #[test]
    fn test_parse() {
        assert_eq!("19.4.0".parse::<ApiVersion>().unwrap(), ApiVersion::new(19, 4, 0));
        assert_eq!(" 1.2.3 ".parse::<ApiVersion>().unwrap().to_string(), "1.2.3");
        assert!("1.2".parse::<ApiVersion>().is_err());
        assert!("1.2.3.4".parse::<ApiVersion>().is_err());
        assert!("1.x.3".parse::<ApiVersion>().is_err());
        assert!(API_VERSION.parse::<ApiVersion>().is_ok());
    }

    #[test]
    fn test_malformed_never_matches() {
        assert!(!match_api_version("2.1.0", "2.1"));
        assert!(!match_api_version("garbage", "2.1.0"));
    }

    proptest! {
        #[test]
        fn prop_patch_is_ignored(major in 0u32..50, minor in 0u32..50, a in 0u32..50, b in 0u32..50) {
            let local = ApiVersion::new(major, minor, a);
            let remote = ApiVersion::new(major, minor, b);
            prop_assert!(local.accepts(&remote));
        }

        #[test]
        fn prop_rule(local in (0u32..10, 0u32..10, 0u32..10), remote in (0u32..10, 0u32..10, 0u32..10)) {
            let l = ApiVersion::new(local.0, local.1, local.2);
            let r = ApiVersion::new(remote.0, remote.1, remote.2);
            prop_assert_eq!(l.accepts(&r), local.0 == remote.0 && remote.1 >= local.1);
        }
    }
}
