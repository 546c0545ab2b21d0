//! Public keys, deploy keys and certificate principals.
//!
//! Keys are looked up by their SHA-256 fingerprint, which is unique across
//! the service; a fingerprint collision fails authentication rather than
//! picking a row.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ssh_key::public::KeyData;
use ssh_key::{Algorithm, HashAlg};
use thiserror::Error;

use crate::identity::{UnknownEnum, UserId};
use crate::repo::RepoId;

/// Key identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub i64);

impl fmt::Display for KeyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a stored key authenticates as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    /// Authenticates its owning user.
    User,
    /// Grants access to a single repository.
    Deploy,
    /// A certificate principal record.
    Principal,
}

impl FromStr for KeyType {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "deploy" => Ok(Self::Deploy),
            "principal" => Ok(Self::Principal),
            other => Err(UnknownEnum::new("key type", other)),
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::User => "user",
            Self::Deploy => "deploy",
            Self::Principal => "principal",
        };
        write!(f, "{s}")
    }
}

/// Access granted by a deploy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeployMode {
    Read,
    Write,
}

impl FromStr for DeployMode {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Self::Read),
            "write" => Ok(Self::Write),
            other => Err(UnknownEnum::new("deploy mode", other)),
        }
    }
}

impl fmt::Display for DeployMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
        }
    }
}

/// Repository binding of a deploy key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeployBinding {
    pub repo: RepoId,
    pub mode: DeployMode,
}

/// A stored public key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredKey {
    pub id: KeyId,
    /// `None` for deploy keys.
    pub owner: Option<UserId>,
    /// `SHA256:`-prefixed base64 fingerprint, the primary lookup key.
    pub fingerprint: String,
    /// Key in OpenSSH authorized-keys format.
    pub content: String,
    pub key_type: KeyType,
    pub deploy: Option<DeployBinding>,
    /// Unix seconds; zero when never used.
    pub last_used: i64,
}

/// Compute the canonical SHA-256 fingerprint of a public key.
pub fn fingerprint(key: &ssh_key::PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

/// Minimum accepted key sizes, in bits, per algorithm family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinKeySizes {
    pub ed25519: usize,
    pub ecdsa: usize,
    pub rsa: usize,
}

impl Default for MinKeySizes {
    fn default() -> Self {
        Self {
            ed25519: 256,
            ecdsa: 256,
            rsa: 3071,
        }
    }
}

/// A key that was rejected by [`MinKeySizes`] or is of an unsupported type.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyPolicyError {
    #[error("{algorithm} key of {bits} bits is below the {minimum}-bit minimum")]
    TooSmall {
        algorithm: &'static str,
        bits: usize,
        minimum: usize,
    },
    #[error("unsupported key algorithm `{0}`")]
    Unsupported(String),
}

/// Size of a key in bits, where the notion applies.
pub fn key_bits(key: &KeyData) -> Option<usize> {
    match key {
        KeyData::Ed25519(_) => Some(256),
        KeyData::Ecdsa(ecdsa) => Some(match ecdsa.curve() {
            ssh_key::EcdsaCurve::NistP256 => 256,
            ssh_key::EcdsaCurve::NistP384 => 384,
            ssh_key::EcdsaCurve::NistP521 => 521,
        }),
        KeyData::Rsa(rsa) => {
            let n = rsa.n.as_bytes();
            // Strip the leading sign byte of the mpint, if present.
            let n = n.strip_prefix(&[0]).unwrap_or(n);
            Some(n.len() * 8)
        }
        _ => None,
    }
}

impl MinKeySizes {
    /// Enforce the policy on an offered key.
    pub fn check(&self, key: &KeyData) -> Result<(), KeyPolicyError> {
        let (family, minimum) = match key.algorithm() {
            Algorithm::Ed25519 => ("ed25519", self.ed25519),
            Algorithm::Ecdsa { .. } => ("ecdsa", self.ecdsa),
            Algorithm::Rsa { .. } => ("rsa", self.rsa),
            other => return Err(KeyPolicyError::Unsupported(other.to_string())),
        };
        let bits = key_bits(key).ok_or_else(|| {
            KeyPolicyError::Unsupported(key.algorithm().to_string())
        })?;
        if bits < minimum {
            return Err(KeyPolicyError::TooSmall {
                algorithm: family,
                bits,
                minimum,
            });
        }
        Ok(())
    }
}
