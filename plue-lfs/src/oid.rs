//! Content addresses.
//!
//! An OID is the lowercase hex SHA-256 of an object's bytes. On disk,
//! objects shard into two directory levels from the first two bytes, the
//! way Git fans out loose objects.
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Hex length of a SHA-256 digest.
pub const OID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OidError {
    #[error("expected {OID_LEN} hex characters, got {0}")]
    Length(usize),
    #[error("invalid character {0:?} in object id")]
    Alphabet(char),
}

/// A validated object id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Oid(String);

impl Oid {
    /// Hash a byte string into its OID.
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        Self(hex::encode(digest))
    }

    /// Wrap a finished SHA-256 digest.
    pub fn from_digest(digest: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(digest.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `ab/cd/<oid>` storage path, relative to a backend root.
    pub fn shard_path(&self) -> PathBuf {
        PathBuf::from(&self.0[..2])
            .join(&self.0[2..4])
            .join(&self.0)
    }
}

impl FromStr for Oid {
    type Err = OidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != OID_LEN {
            return Err(OidError::Length(s.len()));
        }
        if let Some(bad) = s.chars().find(|c| !matches!(c, '0'..='9' | 'a'..='f')) {
            return Err(OidError::Alphabet(bad));
        }
        Ok(Self(s.to_owned()))
    }
}

impl TryFrom<String> for Oid {
    type Error = OidError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Oid> for String {
    fn from(oid: Oid) -> Self {
        oid.0
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_hashing_known_vector() {
        // SHA-256 of the empty string.
        assert_eq!(
            Oid::of(b"").as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_validation() {
        let ok = "a".repeat(64);
        assert!(ok.parse::<Oid>().is_ok());

        assert_eq!("abc".parse::<Oid>(), Err(OidError::Length(3)));
        let upper = "A".repeat(64);
        assert_eq!(upper.parse::<Oid>(), Err(OidError::Alphabet('A')));
        let bad = format!("{}g", "a".repeat(63));
        assert_eq!(bad.parse::<Oid>(), Err(OidError::Alphabet('g')));
    }

    #[test]
    fn test_shard_path() {
        let oid: Oid = "deadbeef00000000000000000000000000000000000000000000000000000000"
            .parse()
            .unwrap();
        assert_eq!(
            oid.shard_path(),
            PathBuf::from("de")
                .join("ad")
                .join("deadbeef00000000000000000000000000000000000000000000000000000000")
        );
    }
}
