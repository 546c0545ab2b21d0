//! The backend abstraction and the unified failure model.
//!
//! Backends are raw, atomically committing byte stores addressed by OID.
//! Content verification, deduplication, quotas and encryption live above
//! them in [`crate::Objects`], so a backend never needs to know whether the
//! bytes it holds are plaintext or ciphertext.
use std::io;

use thiserror::Error;

use crate::meta;
use crate::oid::{Oid, OidError};
use crate::tiered::Tier;

/// Unified storage failure model.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid object id: {0}")]
    InvalidOid(#[from] OidError),
    #[error("checksum mismatch: declared {declared}, content hashes to {actual}")]
    InvalidChecksum { declared: Oid, actual: Oid },
    #[error("size mismatch: declared {declared} bytes, wrote {actual}")]
    SizeMismatch { declared: u64, actual: u64 },
    #[error("{scope} quota of {limit} bytes exceeded")]
    QuotaExceeded { scope: &'static str, limit: u64 },
    #[error("object {0} not found")]
    NotFound(Oid),
    #[error("object {0} is corrupt")]
    Corruption(Oid),
    #[error("storage backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error(transparent)]
    Meta(#[from] meta::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// An inclusive-start byte range for resumable downloads; `end` is
/// exclusive when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn from(start: u64) -> Self {
        Self { start, end: None }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end.saturating_sub(self.start))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

/// An in-flight streaming upload. Either `finalize` or `abort` consumes it;
/// dropping without finalizing must leave no visible object.
pub trait Upload: io::Write + Send {
    /// Commit the written bytes under the OID.
    fn finalize(self: Box<Self>) -> Result<(), Error>;
    /// Discard everything written so far.
    fn abort(self: Box<Self>) -> Result<(), Error>;
}

/// A raw object store. Writes become visible only at commit; a failed or
/// abandoned upload leaves no partial object under its OID.
pub trait Backend: Send + Sync {
    fn put(&self, oid: &Oid, content: &[u8]) -> Result<(), Error> {
        let mut upload = self.upload(oid, content.len() as u64)?;
        if let Err(err) = upload.write_all(content) {
            upload.abort().ok();
            return Err(err.into());
        }
        upload.finalize()
    }

    fn get(&self, oid: &Oid) -> Result<Vec<u8>, Error> {
        let mut reader = self.stream(oid, None)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn stream(&self, oid: &Oid, range: Option<ByteRange>)
        -> Result<Box<dyn io::Read + Send>, Error>;

    fn exists(&self, oid: &Oid) -> Result<bool, Error>;

    /// Physical removal; reference counting happens above.
    fn remove(&self, oid: &Oid) -> Result<(), Error>;

    /// Begin a streaming upload of at most `declared_size` bytes.
    fn upload(&self, oid: &Oid, declared_size: u64) -> Result<Box<dyn Upload>, Error>;

    /// Move an object between tiers. Single-tier backends have nothing to
    /// do.
    fn migrate(&self, _oid: &Oid, _target: Tier) -> Result<(), Error> {
        Ok(())
    }

    /// Remove leftover temporary state older than `max_age_secs`. Returns
    /// how many entries were scavenged.
    fn scavenge(&self, _max_age_secs: u64) -> Result<usize, Error> {
        Ok(0)
    }
}
