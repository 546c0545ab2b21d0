//! Typed service configuration.
//!
//! The INI/environment loader is an external collaborator; it deserializes
//! into these structs. Optional values stay `Option<T>` so that "not set"
//! and "set to the default" remain distinguishable; ambiguous input fails
//! deserialization instead of being guessed at.
use std::path::{Path, PathBuf};

use serde::Deserialize;

/// On-disk layout of the service.
#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    /// Root under which bare repositories live, as `<owner>/<name>.git`.
    pub repositories: PathBuf,
    /// State directory: databases, LFS objects, host keys.
    pub data: PathBuf,
}

impl Paths {
    /// Bare repository directory for `owner/name`.
    pub fn repository(&self, owner: &str, name: &str, wiki: bool) -> PathBuf {
        let suffix = if wiki { ".wiki.git" } else { ".git" };
        self.repositories.join(owner).join(format!("{name}{suffix}"))
    }

    pub fn database(&self) -> PathBuf {
        self.data.join("plue.db")
    }

    pub fn lfs_root(&self) -> PathBuf {
        self.data.join("lfs")
    }

    /// Host keys are written here with mode 0600.
    pub fn host_key(&self) -> PathBuf {
        self.data.join("ssh").join("host_ed25519")
    }
}

/// Git executor section.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GitConfig {
    /// Path to the `git` binary; `git` from `PATH` when unset.
    pub binary: Option<PathBuf>,
    /// Total timeout for one invocation, in seconds.
    pub timeout: Option<u64>,
    /// Longest tolerated gap between reads, in seconds.
    pub write_timeout: Option<u64>,
    /// Address-space cap for children, in bytes.
    pub address_space_limit: Option<u64>,
}

impl GitConfig {
    pub fn binary(&self) -> &Path {
        self.binary.as_deref().unwrap_or_else(|| Path::new("git"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_repository_paths() {
        let paths = Paths {
            repositories: "/srv/plue/repos".into(),
            data: "/srv/plue/data".into(),
        };
        assert_eq!(
            paths.repository("alice", "project", false),
            PathBuf::from("/srv/plue/repos/alice/project.git")
        );
        assert_eq!(
            paths.repository("alice", "project", true),
            PathBuf::from("/srv/plue/repos/alice/project.wiki.git")
        );
    }

    #[test]
    fn test_unset_options_stay_none() {
        let cfg: GitConfig = serde_json::from_str(r#"{ "timeout": 30 }"#).unwrap();
        assert_eq!(cfg.timeout, Some(30));
        assert_eq!(cfg.write_timeout, None);
        assert_eq!(cfg.binary(), Path::new("git"));
    }
}
