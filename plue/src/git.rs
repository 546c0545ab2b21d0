//! Safe execution of the external `git` binary.
//!
//! Every invocation goes through argument and environment validation before
//! anything is spawned: the verb and all dashed options must appear on
//! allow-lists, repository paths are checked for traversal, and the child
//! environment is built from scratch out of an allow-list. The process model
//! (own process group, concurrent output drains, timeouts, output caps)
//! lives in [`process`].
pub mod process;

use std::collections::HashSet;
use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use once_cell::sync::OnceCell;
use thiserror::Error;

use crate::identity::UserId;
use crate::keys::KeyId;

/// Verbs the executor will run. The first positional argument must be one
/// of these.
pub const ALLOWED_VERBS: &[&str] = &[
    "version",
    "init",
    "config",
    "show",
    "ls-tree",
    "log",
    "rev-parse",
    "rev-list",
    "diff",
    "cat-file",
    "for-each-ref",
    "upload-pack",
    "receive-pack",
    "upload-archive",
];

/// Dashed options accepted after the verb. Matched on the part before `=`.
pub const ALLOWED_OPTIONS: &[&str] = &[
    "--",
    "-c",
    "-r",
    "-z",
    "--advertise-refs",
    "--bare",
    "--first-parent",
    "--format",
    "--get",
    "--name-only",
    "--no-merges",
    "--porcelain",
    "--reverse",
    "--stateless-rpc",
    "--strict",
    "--timeout",
];

/// Options rejected unconditionally, before the allow-list is consulted.
pub const DENIED_OPTIONS: &[&str] = &[
    // Legacy alias that re-enters argument parsing.
    "--upload-archive",
    // Arbitrary file write.
    "--output",
    // Arbitrary command execution via helper overrides.
    "--exec",
    "--upload-pack",
    "--receive-pack",
];

/// Environment variables forwarded to the child: these exact names, plus
/// the `GIT_` and `PLUE_` prefixes.
const ALLOWED_ENV: &[&str] = &["HOME", "PATH", "LANG", "LC_ALL"];

pub(crate) fn env_allowed(name: &str) -> bool {
    name.starts_with("GIT_") || name.starts_with("PLUE_") || ALLOWED_ENV.contains(&name)
}

/// Where the child's stdin comes from.
pub enum Stdin {
    Null,
    Bytes(Vec<u8>),
    Reader(Box<dyn io::Read + Send>),
}

impl Default for Stdin {
    fn default() -> Self {
        Self::Null
    }
}

impl fmt::Debug for Stdin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "Stdin::Null"),
            Self::Bytes(b) => write!(f, "Stdin::Bytes({} bytes)", b.len()),
            Self::Reader(_) => write!(f, "Stdin::Reader"),
        }
    }
}

/// Per-invocation options.
#[derive(Debug, Default)]
pub struct Options {
    /// Working directory of the child.
    pub cwd: Option<PathBuf>,
    /// Environment overrides; every name must pass the allow-list.
    pub env: Vec<(String, String)>,
    pub stdin: Stdin,
    /// Total wall-clock budget; falls back to the executor limit.
    pub timeout: Option<Duration>,
    /// Longest tolerated gap between successful reads.
    pub write_timeout: Option<Duration>,
}

/// Executor-wide limits.
#[derive(Debug, Clone)]
pub struct Limits {
    pub timeout: Duration,
    pub write_timeout: Duration,
    /// Cumulative output cap for buffered runs.
    pub max_buffered: u64,
    /// Cumulative output cap for streaming runs.
    pub max_streamed: u64,
    /// `RLIMIT_AS` applied to the child, when set.
    pub address_space: Option<u64>,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3600),
            write_timeout: Duration::from_secs(60),
            max_buffered: 64 * 1024 * 1024,
            max_streamed: 1024 * 1024 * 1024,
            address_space: None,
        }
    }
}

/// Captured result of a buffered run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Everything known about a failed invocation.
#[derive(Debug, Default, Clone)]
pub struct Diagnostic {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub exit_code: Option<i32>,
    /// Last few kilobytes of stderr.
    pub stderr_tail: Vec<u8>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "`{} {}`", self.command, self.args.join(" "))?;
        if let Some(code) = self.exit_code {
            write!(f, " (exit code {code})")?;
        }
        if !self.stderr_tail.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.stderr_tail).trim())?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum ErrorKind {
    #[error("git binary not found")]
    GitNotFound,
    #[error("invalid argument `{arg}`: {reason}")]
    InvalidArgument { arg: String, reason: String },
    #[error("git command timed out")]
    Timeout,
    #[error("git command failed with exit code {code}")]
    ProcessFailed { code: i32 },
    #[error("permission denied executing git")]
    PermissionDenied,
    #[error("git command produced more than {limit} bytes of output")]
    OutputTooLarge { limit: u64 },
    #[error("failed to spawn git: {0}")]
    ChildSpawnFailed(#[source] io::Error),
    #[error("i/o error talking to git: {0}")]
    Io(#[source] io::Error),
}

/// Executor failure, always carrying the invocation diagnostic.
#[derive(Debug, Error)]
#[error("{kind} ({diagnostic})")]
pub struct Error {
    pub kind: ErrorKind,
    pub diagnostic: Box<Diagnostic>,
}

impl Error {
    fn new(kind: ErrorKind, diagnostic: Diagnostic) -> Self {
        Self {
            kind,
            diagnostic: Box::new(diagnostic),
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }
}

/// One of the three smart-protocol services, shared by the SSH and HTTP
/// front-ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Service {
    UploadPack,
    ReceivePack,
    UploadArchive,
}

impl Service {
    /// `Cache-Control` sent with every smart-HTTP response.
    pub const CACHE_CONTROL: &'static str = "no-cache";

    pub fn name(&self) -> &'static str {
        match self {
            Self::UploadPack => "upload-pack",
            Self::ReceivePack => "receive-pack",
            Self::UploadArchive => "upload-archive",
        }
    }

    /// Content type of the smart-HTTP ref advertisement.
    pub fn advertisement_content_type(&self) -> String {
        format!("application/x-git-{}-advertisement", self.name())
    }

    /// Content type of the smart-HTTP result.
    pub fn result_content_type(&self) -> String {
        format!("application/x-git-{}-result", self.name())
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "git-{}", self.name())
    }
}

/// Hook environment describing who is pushing where, forwarded to processes
/// spawned on behalf of a protocol request.
#[derive(Debug, Clone, Default)]
pub struct ProtocolContext {
    pub pusher_id: Option<UserId>,
    pub pusher_name: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub is_wiki: bool,
    pub key_id: Option<KeyId>,
    pub is_internal: bool,
    pub pr_id: Option<i64>,
}

impl ProtocolContext {
    /// The hook environment, all under the `PLUE_` prefix.
    pub fn env(&self) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "PLUE_PUSHER_ID".to_owned(),
                self.pusher_id.map(|id| id.to_string()).unwrap_or_default(),
            ),
            ("PLUE_PUSHER_NAME".to_owned(), self.pusher_name.clone()),
            ("PLUE_REPO_USER_NAME".to_owned(), self.repo_owner.clone()),
            ("PLUE_REPO_NAME".to_owned(), self.repo_name.clone()),
            (
                "PLUE_REPO_IS_WIKI".to_owned(),
                if self.is_wiki { "true" } else { "false" }.to_owned(),
            ),
        ];
        if let Some(key) = self.key_id {
            env.push(("PLUE_KEY_ID".to_owned(), key.to_string()));
        }
        if self.is_internal {
            env.push(("PLUE_IS_INTERNAL".to_owned(), "true".to_owned()));
        }
        if let Some(pr) = self.pr_id {
            env.push(("PLUE_PR_ID".to_owned(), pr.to_string()));
        }
        env
    }
}

/// The Git command executor.
pub struct Executor {
    binary: PathBuf,
    limits: Limits,
    version: OnceCell<String>,
}

impl Default for Executor {
    fn default() -> Self {
        Self::new("git", Limits::default())
    }
}

impl Executor {
    pub fn new(binary: impl Into<PathBuf>, limits: Limits) -> Self {
        process::init();
        Self {
            binary: binary.into(),
            limits,
            version: OnceCell::new(),
        }
    }

    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// The version string of the configured binary, probed once.
    pub fn version(&self) -> Result<&str, Error> {
        self.version
            .get_or_try_init(|| {
                let out = self.run(["version"], Options::default())?;
                Ok(String::from_utf8_lossy(&out.stdout).trim().to_owned())
            })
            .map(String::as_str)
    }

    /// Run to completion, capturing both streams concurrently. A non-zero
    /// exit is reported as [`ErrorKind::ProcessFailed`].
    pub fn run(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        options: Options,
    ) -> Result<Output, Error> {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let cwd = options.cwd.clone();
        let code = self.execute(
            args.clone(),
            options,
            self.limits.max_buffered,
            &mut stdout,
            &mut stderr,
        )?;
        if code != 0 {
            let diagnostic = Diagnostic {
                command: self.binary.display().to_string(),
                args,
                cwd,
                exit_code: Some(code),
                stderr_tail: tail(&stderr),
            };
            return Err(Error::new(ErrorKind::ProcessFailed { code }, diagnostic));
        }
        Ok(Output {
            stdout,
            stderr,
            exit_code: code,
        })
    }

    /// Run with caller-provided sinks receiving chunks as they arrive.
    /// Returns the exit code, zero or not; protocol front-ends propagate it.
    pub fn run_streaming(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        options: Options,
        stdout: &mut (dyn io::Write + Send),
        stderr: &mut (dyn io::Write + Send),
    ) -> Result<i32, Error> {
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        self.execute(args, options, self.limits.max_streamed, stdout, stderr)
    }

    /// Streaming run with the hook environment of a protocol request.
    pub fn run_with_protocol_context(
        &self,
        args: impl IntoIterator<Item = impl Into<String>>,
        stdin: Stdin,
        ctx: &ProtocolContext,
        mut options: Options,
        stdout: &mut (dyn io::Write + Send),
        stderr: &mut (dyn io::Write + Send),
    ) -> Result<i32, Error> {
        options.stdin = stdin;
        options.env.extend(ctx.env());
        self.run_streaming(args, options, stdout, stderr)
    }

    fn execute(
        &self,
        args: Vec<String>,
        options: Options,
        max_output: u64,
        stdout: &mut (dyn io::Write + Send),
        stderr: &mut (dyn io::Write + Send),
    ) -> Result<i32, Error> {
        let diagnostic = |exit_code: Option<i32>, stderr_tail: Vec<u8>| Diagnostic {
            command: self.binary.display().to_string(),
            args: args.clone(),
            cwd: options.cwd.clone(),
            exit_code,
            stderr_tail,
        };

        if let Err((arg, reason)) = validate_args(&args) {
            return Err(Error::new(
                ErrorKind::InvalidArgument { arg, reason },
                diagnostic(None, Vec::new()),
            ));
        }
        for (name, _) in &options.env {
            if !env_allowed(name) {
                return Err(Error::new(
                    ErrorKind::InvalidArgument {
                        arg: name.clone(),
                        reason: "environment variable is not on the allow-list".to_owned(),
                    },
                    diagnostic(None, Vec::new()),
                ));
            }
        }

        let request = process::Request {
            binary: &self.binary,
            args: &args,
            cwd: options.cwd.as_deref(),
            env: collect_env(&options.env),
            stdin: options.stdin,
            timeout: options.timeout.unwrap_or(self.limits.timeout),
            write_timeout: options.write_timeout.unwrap_or(self.limits.write_timeout),
            max_output,
            address_space: self.limits.address_space,
        };

        match process::run(request, stdout, stderr) {
            Ok(done) => Ok(done.exit_code),
            Err(fault) => {
                let d = diagnostic(fault.exit_code, fault.stderr_tail);
                let kind = match fault.kind {
                    process::FaultKind::Spawn(err) if err.kind() == io::ErrorKind::NotFound => {
                        ErrorKind::GitNotFound
                    }
                    process::FaultKind::Spawn(err)
                        if err.kind() == io::ErrorKind::PermissionDenied =>
                    {
                        ErrorKind::PermissionDenied
                    }
                    process::FaultKind::Spawn(err) => ErrorKind::ChildSpawnFailed(err),
                    process::FaultKind::Timeout => ErrorKind::Timeout,
                    process::FaultKind::OutputTooLarge => {
                        ErrorKind::OutputTooLarge { limit: max_output }
                    }
                    process::FaultKind::Io(err) => ErrorKind::Io(err),
                };
                Err(Error::new(kind, d))
            }
        }
    }
}

/// Child environment: parent variables passing the allow-list, then the
/// validated overrides.
fn collect_env(overrides: &[(String, String)]) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = std::env::vars().filter(|(k, _)| env_allowed(k)).collect();
    for (name, value) in overrides {
        match env.iter_mut().find(|(k, _)| k == name) {
            Some(entry) => entry.1 = value.clone(),
            None => env.push((name.clone(), value.clone())),
        }
    }
    env
}

/// Enforce the argument rules. Returns the offending argument and a reason.
fn validate_args(args: &[String]) -> Result<(), (String, String)> {
    let denied: HashSet<&str> = DENIED_OPTIONS.iter().copied().collect();
    let allowed: HashSet<&str> = ALLOWED_OPTIONS.iter().copied().collect();

    let mut verb: Option<&str> = None;
    let mut expect_value = false;

    for arg in args {
        if expect_value {
            // Operand of `-c`; a config pair, not a path.
            expect_value = false;
            continue;
        }
        if arg.starts_with('-') {
            let name = arg.split('=').next().unwrap_or(arg);
            if denied.contains(name) {
                return Err((arg.clone(), "option is deny-listed".to_owned()));
            }
            if verb.is_none() {
                // Only `-c key=value` may precede the verb.
                if name != "-c" {
                    return Err((arg.clone(), "option not allowed before the verb".to_owned()));
                }
            } else if !allowed.contains(name) {
                return Err((arg.clone(), "option is not on the allow-list".to_owned()));
            }
            if name == "-c" && arg == "-c" {
                expect_value = true;
            }
            continue;
        }
        if verb.is_none() {
            if !ALLOWED_VERBS.contains(&arg.as_str()) {
                return Err((arg.clone(), "verb is not on the allow-list".to_owned()));
            }
            verb = Some(arg);
            continue;
        }
        // Positional operand: treated as a repository-relative path.
        if let Err(err) = crate::repo::validate_path(arg) {
            return Err((arg.clone(), err.to_string()));
        }
    }
    if verb.is_none() {
        return Err((String::new(), "missing verb".to_owned()));
    }
    Ok(())
}

pub(crate) fn tail(stderr: &[u8]) -> Vec<u8> {
    const LIMIT: usize = 8 * 1024;
    let start = stderr.len().saturating_sub(LIMIT);
    stderr[start..].to_vec()
}
