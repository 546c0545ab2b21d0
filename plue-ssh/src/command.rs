//! Extraction of the single Git command carried by an SSH `exec` request.
//!
//! The payload is split with POSIX shell quoting rules; no shell is ever
//! invoked. The verb must be one of the known service verbs and the
//! repository operand is normalized and strictly validated.
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use plue::git::Service;
use plue::repo::{PathError, RepoPath};

/// Direction of an LFS request, from the third token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LfsOperation {
    Download,
    Upload,
}

impl FromStr for LfsOperation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "download" => Ok(Self::Download),
            "upload" => Ok(Self::Upload),
            other => Err(Error::BadLfsOperation(other.to_owned())),
        }
    }
}

impl fmt::Display for LfsOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Download => write!(f, "download"),
            Self::Upload => write!(f, "upload"),
        }
    }
}

/// The parsed command of one exec request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SshCommand {
    /// One of the three smart services.
    Git { service: Service, repo: RepoPath },
    /// `git-lfs-authenticate <repo> <download|upload>`.
    LfsAuthenticate {
        repo: RepoPath,
        operation: LfsOperation,
    },
    /// `git-lfs-transfer <repo> <download|upload>`.
    LfsTransfer {
        repo: RepoPath,
        operation: LfsOperation,
    },
    /// Capability probe used by the AGit flow; always permitted.
    SshInfo,
}

impl SshCommand {
    pub fn repo(&self) -> Option<&RepoPath> {
        match self {
            Self::Git { repo, .. }
            | Self::LfsAuthenticate { repo, .. }
            | Self::LfsTransfer { repo, .. } => Some(repo),
            Self::SshInfo => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("malformed command line")]
    Malformed,
    #[error("empty command")]
    Empty,
    #[error("unsupported command `{0}`")]
    UnsupportedVerb(String),
    #[error("missing repository operand")]
    MissingRepository,
    #[error("invalid repository `{repo}`: {err}")]
    BadRepository { repo: String, err: PathError },
    #[error("missing LFS operation")]
    MissingLfsOperation,
    #[error("unknown LFS operation `{0}`")]
    BadLfsOperation(String),
    #[error("unexpected trailing arguments")]
    Trailing,
}

/// Parse an exec payload into a command.
pub fn parse(payload: &str) -> Result<SshCommand, Error> {
    let words = shlex::split(payload).ok_or(Error::Malformed)?;
    let mut words = words.into_iter();
    let verb = words.next().ok_or(Error::Empty)?;

    let command = match verb.as_str() {
        "ssh_info" => SshCommand::SshInfo,
        "git-upload-pack" => SshCommand::Git {
            service: Service::UploadPack,
            repo: repo_operand(words.next())?,
        },
        "git-receive-pack" => SshCommand::Git {
            service: Service::ReceivePack,
            repo: repo_operand(words.next())?,
        },
        "git-upload-archive" => SshCommand::Git {
            service: Service::UploadArchive,
            repo: repo_operand(words.next())?,
        },
        "git-lfs-authenticate" => SshCommand::LfsAuthenticate {
            repo: repo_operand(words.next())?,
            operation: lfs_operand(words.next())?,
        },
        "git-lfs-transfer" => SshCommand::LfsTransfer {
            repo: repo_operand(words.next())?,
            operation: lfs_operand(words.next())?,
        },
        _ => return Err(Error::UnsupportedVerb(verb)),
    };
    if words.next().is_some() {
        return Err(Error::Trailing);
    }
    Ok(command)
}

/// Normalize the repository operand: strip any stray quoting the client
/// doubled up on, a leading `/` and a trailing `.git`, then require exactly
/// two clean path components.
fn repo_operand(word: Option<String>) -> Result<RepoPath, Error> {
    let raw = word.ok_or(Error::MissingRepository)?;
    let trimmed = raw
        .trim_matches(|c| c == '\'' || c == '"')
        .trim_start_matches('/');
    let trimmed = trimmed.strip_suffix(".git").unwrap_or(trimmed);
    trimmed.parse().map_err(|err| Error::BadRepository {
        repo: raw.clone(),
        err,
    })
}

fn lfs_operand(word: Option<String>) -> Result<LfsOperation, Error> {
    word.ok_or(Error::MissingLfsOperation)?.parse()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_upload_pack_with_quoting() {
        let cmd = parse("git-upload-pack 'alice/project.git'").unwrap();
        let SshCommand::Git { service, repo } = cmd else {
            panic!("expected a git command");
        };
        assert_eq!(service, Service::UploadPack);
        assert_eq!(repo.to_string(), "alice/project");
    }

    #[test]
    fn test_leading_slash_and_suffix_trimmed() {
        let cmd = parse("git-receive-pack /acme/infra.git").unwrap();
        assert_eq!(cmd.repo().unwrap().to_string(), "acme/infra");
    }

    #[test]
    fn test_verb_allow_list() {
        assert_eq!(
            parse("git-shell alice/project"),
            Err(Error::UnsupportedVerb("git-shell".to_owned()))
        );
        assert_eq!(parse("rm -rf /").err(), Some(Error::UnsupportedVerb("rm".to_owned())));
        assert_eq!(parse(""), Err(Error::Empty));
    }

    #[test]
    fn test_repository_validation() {
        assert!(matches!(
            parse("git-upload-pack '../etc'"),
            Err(Error::BadRepository { .. })
        ));
        assert!(matches!(
            parse("git-upload-pack 'a/b/c'"),
            Err(Error::BadRepository { .. })
        ));
        assert!(matches!(
            parse(r"git-upload-pack 'a\b'"),
            Err(Error::BadRepository { .. })
        ));
        assert_eq!(parse("git-upload-pack"), Err(Error::MissingRepository));
    }

    #[test]
    fn test_lfs_third_token_required() {
        let cmd = parse("git-lfs-authenticate alice/project.git upload").unwrap();
        assert_eq!(
            cmd,
            SshCommand::LfsAuthenticate {
                repo: "alice/project".parse().unwrap(),
                operation: LfsOperation::Upload,
            }
        );
        assert_eq!(
            parse("git-lfs-authenticate alice/project.git"),
            Err(Error::MissingLfsOperation)
        );
        assert_eq!(
            parse("git-lfs-authenticate alice/project.git sideways"),
            Err(Error::BadLfsOperation("sideways".to_owned()))
        );
    }

    #[test]
    fn test_ssh_info_and_trailing_arguments() {
        assert_eq!(parse("ssh_info"), Ok(SshCommand::SshInfo));
        assert_eq!(parse("ssh_info now"), Err(Error::Trailing));
        assert_eq!(
            parse("git-upload-pack a/b extra"),
            Err(Error::Trailing)
        );
    }
}
