//! Repositories and repository path validation.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{SubjectId, Unit, Visibility};

/// Longest repository path accepted anywhere in the service.
pub const MAX_PATH_LEN: usize = 1024;

/// Repository identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoId(pub i64);

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A repository record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repository {
    pub id: RepoId,
    pub owner: SubjectId,
    pub name: String,
    pub visibility: Visibility,
    pub archived: bool,
    pub mirror: bool,
    pub deleted: bool,
    /// Units switched off for this repository. A disabled unit grants no
    /// access from any source.
    pub disabled_units: BTreeSet<Unit>,
}

impl Repository {
    pub fn is_unit_enabled(&self, unit: Unit) -> bool {
        !self.disabled_units.contains(&unit)
    }
}

/// Why a repository path was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PathError {
    #[error("path is empty")]
    Empty,
    #[error("absolute paths are not allowed")]
    Absolute,
    #[error("path contains a `..` segment")]
    ParentSegment,
    #[error("path contains a backslash")]
    Backslash,
    #[error("path exceeds {MAX_PATH_LEN} bytes")]
    TooLong,
    #[error("expected exactly two path components")]
    Components,
    #[error("path component is empty")]
    EmptyComponent,
}

/// Validate a relative repository path for use as a subprocess argument.
///
/// Rejects absolute paths, `..` segments, backslashes and over-long input.
/// Accepts any number of components; use [`RepoPath`] where exactly
/// `owner/name` is required.
pub fn validate_path(path: &str) -> Result<(), PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    if path.len() > MAX_PATH_LEN {
        return Err(PathError::TooLong);
    }
    if path.starts_with('/') {
        return Err(PathError::Absolute);
    }
    if path.contains('\\') {
        return Err(PathError::Backslash);
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err(PathError::ParentSegment);
    }
    Ok(())
}

/// An `owner/name` repository address, as found in protocol requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoPath {
    owner: String,
    name: String,
}

impl RepoPath {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FromStr for RepoPath {
    type Err = PathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        validate_path(s)?;

        let mut parts = s.split('/');
        let owner = parts.next().ok_or(PathError::Components)?;
        let name = parts.next().ok_or(PathError::Components)?;
        if parts.next().is_some() {
            return Err(PathError::Components);
        }
        if owner.is_empty() || name.is_empty() {
            return Err(PathError::EmptyComponent);
        }
        Ok(Self {
            owner: owner.to_owned(),
            name: name.to_owned(),
        })
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}
