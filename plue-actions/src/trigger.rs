//! Post-receive trigger: push events in, workflow runs out.
//!
//! Workflow descriptors arrive pre-parsed from the external YAML
//! collaborator. A push event is matched against each stored workflow's
//! triggers; matches get a run (with an atomically assigned `run_number`)
//! and the workflow's jobs enqueued on the dispatcher. Commit lists and
//! changed paths come from the Git executor. Unknown trigger kinds are
//! refused, never silently accepted.
use std::collections::{BTreeMap, BTreeSet};

use globset::Glob;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use plue::config::Paths;
use plue::git::{self, Executor, Options};
use plue::identity::UserId;
use plue::repo::RepoId;

use crate::dispatch::{self, Dispatcher};
use crate::job::{JobId, JobStatus, Priority, QueuedJob, Requirements};
use crate::store::{self, RunId, Store, WorkflowId};

/// SHA-1 of the empty tree, used to diff an initial push.
const EMPTY_TREE: &str = "4b825dc642cb6eb9a060e54bf8d69288fbee4904";

/// A trigger clause of a workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trigger {
    /// `push` or `tag`. Anything else is refused at fire time.
    pub kind: String,
    /// Branch patterns for `push`; empty matches every branch.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Tag patterns for `tag`; empty matches every tag.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Changed-path patterns; empty matches any change.
    #[serde(default)]
    pub paths: Vec<String>,
}

/// One job of a workflow, as parsed by the external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub requirements: Requirements,
    /// Keys of jobs in the same workflow this one depends on.
    #[serde(default)]
    pub needs: Vec<String>,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Default for JobSpec {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            requirements: Requirements::default(),
            needs: Vec::new(),
            max_retries: 0,
            timeout_secs: default_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    3600
}

/// A stored workflow descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    pub id: WorkflowId,
    pub repo: RepoId,
    pub filename: String,
    pub triggers: Vec<Trigger>,
    pub jobs: BTreeMap<String, JobSpec>,
}

/// A parsed push, handed over by the receive hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushEvent {
    pub repo: RepoId,
    pub owner: String,
    pub name: String,
    /// Full ref, e.g. `refs/heads/main`.
    pub ref_name: String,
    pub before: String,
    pub after: String,
    pub actor: UserId,
}

impl PushEvent {
    /// An all-zero `before` marks a ref creation.
    pub fn is_initial(&self) -> bool {
        !self.before.is_empty() && self.before.bytes().all(|b| b == b'0')
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unsupported trigger kind `{0}`")]
    UnsupportedKind(String),
    #[error("invalid trigger pattern: {0}")]
    Pattern(#[from] globset::Error),
    #[error(transparent)]
    Git(#[from] git::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Dispatch(#[from] dispatch::Error),
}

enum RefKind<'a> {
    Branch(&'a str),
    Tag(&'a str),
    Other,
}

fn classify(ref_name: &str) -> RefKind<'_> {
    if let Some(branch) = ref_name.strip_prefix("refs/heads/") {
        RefKind::Branch(branch)
    } else if let Some(tag) = ref_name.strip_prefix("refs/tags/") {
        RefKind::Tag(tag)
    } else {
        RefKind::Other
    }
}

/// Turns push events into workflow runs.
pub struct PostReceive<'a> {
    store: &'a Store,
    dispatcher: &'a Dispatcher,
    executor: &'a Executor,
    paths: &'a Paths,
}

impl<'a> PostReceive<'a> {
    pub fn new(
        store: &'a Store,
        dispatcher: &'a Dispatcher,
        executor: &'a Executor,
        paths: &'a Paths,
    ) -> Self {
        Self {
            store,
            dispatcher,
            executor,
            paths,
        }
    }

    /// Fan a push event out to every matching workflow. Runs are created
    /// and enqueued in workflow order; commits in the snapshot keep the
    /// push's per-ref order.
    pub fn fire(&self, event: &PushEvent, now: i64) -> Result<Vec<RunId>, Error> {
        let workflows = self.store.workflows_for(event.repo)?;
        if workflows.is_empty() {
            return Ok(Vec::new());
        }
        let kind = classify(&event.ref_name);
        if matches!(kind, RefKind::Other) {
            log::debug!(target: "trigger", "Ignoring push to {}", event.ref_name);
            return Ok(Vec::new());
        }

        let commits = self.commits(event)?;
        let changed = self.changed_paths(event)?;
        log::debug!(
            target: "trigger",
            "Push to {} ({} commit(s), {} changed path(s))",
            event.ref_name,
            commits.len(),
            changed.len()
        );

        let mut runs = Vec::new();
        for workflow in workflows {
            if !self.matches(&workflow, &kind, &changed)? {
                continue;
            }
            let snapshot = serde_json::json!({
                "ref": event.ref_name,
                "before": event.before,
                "after": event.after,
                "commits": commits,
                "changed_paths": changed,
            });
            let run = self.store.create_run(
                workflow.id,
                event.repo,
                &snapshot,
                &event.after,
                &event.ref_name,
                event.actor,
                now,
            )?;
            log::info!(
                target: "trigger",
                "Workflow {} run #{} created for {}",
                workflow.filename,
                run.run_number,
                event.ref_name
            );
            let jobs = jobs_for_run(run.id, &workflow.jobs, now);
            self.dispatcher.enqueue(jobs, now)?;
            runs.push(run.id);
        }
        Ok(runs)
    }

    fn matches(&self, workflow: &Workflow, kind: &RefKind, changed: &[String]) -> Result<bool, Error> {
        for trigger in &workflow.triggers {
            match (trigger.kind.as_str(), kind) {
                ("push", RefKind::Branch(branch)) => {
                    if !matches_any(&trigger.branches, branch)? {
                        continue;
                    }
                }
                ("tag", RefKind::Tag(tag)) => {
                    if !matches_any(&trigger.tags, tag)? {
                        continue;
                    }
                }
                ("push", _) | ("tag", _) => continue,
                (other, _) => return Err(Error::UnsupportedKind(other.to_owned())),
            }

            if trigger.paths.is_empty() {
                return Ok(true);
            }
            for path in changed {
                if matches_any(&trigger.paths, path)? {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Commits introduced by the push, oldest first.
    fn commits(&self, event: &PushEvent) -> Result<Vec<String>, Error> {
        let range = if event.is_initial() {
            event.after.clone()
        } else {
            format!("{}..{}", event.before, event.after)
        };
        let out = self.executor.run(
            ["rev-list", "--reverse", range.as_str()],
            self.repo_options(event),
        )?;
        Ok(lines(&out.stdout))
    }

    fn changed_paths(&self, event: &PushEvent) -> Result<Vec<String>, Error> {
        let before: &str = if event.is_initial() {
            EMPTY_TREE
        } else {
            &event.before
        };
        let out = self.executor.run(
            ["diff", "--name-only", before, event.after.as_str()],
            self.repo_options(event),
        )?;
        Ok(lines(&out.stdout))
    }

    fn repo_options(&self, event: &PushEvent) -> Options {
        Options {
            cwd: Some(self.paths.repository(&event.owner, &event.name, false)),
            ..Options::default()
        }
    }
}

fn jobs_for_run(run: RunId, specs: &BTreeMap<String, JobSpec>, now: i64) -> Vec<QueuedJob> {
    specs
        .iter()
        .map(|(key, spec)| QueuedJob {
            id: JobId(0),
            run,
            key: key.clone(),
            priority: spec.priority,
            requirements: spec.requirements.clone(),
            deps: spec.needs.iter().cloned().collect::<BTreeSet<_>>(),
            retry_count: 0,
            max_retries: spec.max_retries,
            timeout_secs: spec.timeout_secs,
            enqueued_at: now,
            status: JobStatus::Pending,
            reason: None,
        })
        .collect()
}

fn matches_any(patterns: &[String], value: &str) -> Result<bool, globset::Error> {
    if patterns.is_empty() {
        return Ok(true);
    }
    for pattern in patterns {
        if Glob::new(pattern)?.compile_matcher().is_match(value) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn lines(bytes: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter(|l| !l.is_empty())
        .map(str::to_owned)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchConfig;
    use crate::runner::{Capabilities, RunnerId};
    use plue::git::Limits;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) -> String {
        let out = Command::new("git")
            .args(args)
            .current_dir(dir)
            .env("GIT_AUTHOR_NAME", "test")
            .env("GIT_AUTHOR_EMAIL", "test@plue.invalid")
            .env("GIT_COMMITTER_NAME", "test")
            .env("GIT_COMMITTER_EMAIL", "test@plue.invalid")
            .output()
            .expect("git must be runnable in tests");
        assert!(
            out.status.success(),
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&out.stderr)
        );
        String::from_utf8_lossy(&out.stdout).trim().to_owned()
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        paths: Paths,
        dispatcher: Dispatcher,
        executor: Executor,
        sha1: String,
        sha2: String,
    }

    impl Fixture {
        /// Workflows, runs and jobs share the dispatcher's store.
        fn store(&self) -> &Store {
            self.dispatcher.store()
        }

        fn post(&self) -> PostReceive<'_> {
            PostReceive::new(self.store(), &self.dispatcher, &self.executor, &self.paths)
        }
    }

    /// A working repository at `repos/alice/project.git` with two commits:
    /// `a.txt`, then `src/b.txt`.
    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let repos = dir.path().join("repos");
        let repo = repos.join("alice").join("project.git");
        std::fs::create_dir_all(&repo).unwrap();

        git(&repo, &["init", "-q"]);
        std::fs::write(repo.join("a.txt"), "one\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "one"]);
        let sha1 = git(&repo, &["rev-parse", "HEAD"]);

        std::fs::create_dir_all(repo.join("src")).unwrap();
        std::fs::write(repo.join("src").join("b.txt"), "two\n").unwrap();
        git(&repo, &["add", "."]);
        git(&repo, &["commit", "-q", "-m", "two"]);
        let sha2 = git(&repo, &["rev-parse", "HEAD"]);

        Fixture {
            paths: Paths {
                repositories: repos,
                data: dir.path().join("data"),
            },
            _dir: dir,
            dispatcher: Dispatcher::new(Store::memory().unwrap(), DispatchConfig::default()),
            executor: Executor::new("git", Limits::default()),
            sha1,
            sha2,
        }
    }

    fn event(f: &Fixture, before: &str, after: &str) -> PushEvent {
        PushEvent {
            repo: RepoId(1),
            owner: "alice".to_owned(),
            name: "project".to_owned(),
            ref_name: "refs/heads/main".to_owned(),
            before: before.to_owned(),
            after: after.to_owned(),
            actor: UserId(7),
        }
    }

    fn push_workflow(f: &Fixture, filename: &str, trigger: Trigger) -> WorkflowId {
        let jobs: BTreeMap<String, JobSpec> = [
            ("build".to_owned(), JobSpec::default()),
            (
                "test".to_owned(),
                JobSpec {
                    needs: vec!["build".to_owned()],
                    ..JobSpec::default()
                },
            ),
        ]
        .into();
        f.store()
            .upsert_workflow(RepoId(1), filename, &[trigger], &jobs)
            .unwrap()
    }

    #[test]
    fn test_push_fires_matching_workflow() {
        let f = fixture();
        push_workflow(
            &f,
            "ci.yaml",
            Trigger {
                kind: "push".to_owned(),
                branches: vec!["main".to_owned()],
                ..Trigger::default()
            },
        );
        let post = f.post();

        let runs = post.fire(&event(&f, &f.sha1, &f.sha2), 100).unwrap();
        assert_eq!(runs.len(), 1);

        let run = f.store().run(runs[0]).unwrap().unwrap();
        assert_eq!(run.run_number, 1);
        assert_eq!(run.sha, f.sha2);
        assert_eq!(run.trigger["commits"], serde_json::json!([f.sha2]));
        assert_eq!(run.trigger["changed_paths"], serde_json::json!(["src/b.txt"]));

        // `build` is ready, `test` waits on it.
        let polled = f
            .dispatcher
            .poll(
                RunnerId(1),
                "r1",
                Capabilities {
                    labels: Default::default(),
                    architecture: "amd64".to_owned(),
                    memory_mb: 1024,
                    cpus: 2,
                    docker: false,
                    max_parallel: 4,
                },
                101,
            )
            .unwrap()
            .unwrap();
        assert_eq!(polled.key, "build");

        // A second push to the same workflow gets the next number.
        let runs = post.fire(&event(&f, &f.sha1, &f.sha2), 200).unwrap();
        let run = f.store().run(runs[0]).unwrap().unwrap();
        assert_eq!(run.run_number, 2);
    }

    #[test]
    fn test_initial_push_uses_full_history() {
        let f = fixture();
        push_workflow(
            &f,
            "ci.yaml",
            Trigger {
                kind: "push".to_owned(),
                ..Trigger::default()
            },
        );
        let post = f.post();

        let zeros = "0".repeat(40);
        let runs = post.fire(&event(&f, &zeros, &f.sha2), 100).unwrap();
        let run = f.store().run(runs[0]).unwrap().unwrap();
        assert_eq!(
            run.trigger["commits"],
            serde_json::json!([f.sha1, f.sha2]),
            "oldest first"
        );
        assert_eq!(
            run.trigger["changed_paths"],
            serde_json::json!(["a.txt", "src/b.txt"])
        );
    }

    #[test]
    fn test_branch_and_path_filters() {
        let f = fixture();
        push_workflow(
            &f,
            "release.yaml",
            Trigger {
                kind: "push".to_owned(),
                branches: vec!["release/*".to_owned()],
                ..Trigger::default()
            },
        );
        push_workflow(
            &f,
            "docs.yaml",
            Trigger {
                kind: "push".to_owned(),
                paths: vec!["docs/**".to_owned()],
                ..Trigger::default()
            },
        );
        push_workflow(
            &f,
            "src.yaml",
            Trigger {
                kind: "push".to_owned(),
                paths: vec!["src/**".to_owned()],
                ..Trigger::default()
            },
        );
        let post = f.post();

        let runs = post.fire(&event(&f, &f.sha1, &f.sha2), 100).unwrap();
        assert_eq!(runs.len(), 1, "only the src/** workflow matches");
        let run = f.store().run(runs[0]).unwrap().unwrap();
        let fired = f
            .store()
            .workflows_for(RepoId(1))
            .unwrap()
            .into_iter()
            .find(|w| w.id == run.workflow)
            .unwrap();
        assert_eq!(fired.filename, "src.yaml");
    }

    #[test]
    fn test_unknown_trigger_kind_is_refused() {
        let f = fixture();
        push_workflow(
            &f,
            "manual.yaml",
            Trigger {
                kind: "workflow_dispatch".to_owned(),
                ..Trigger::default()
            },
        );
        let post = f.post();

        let err = post.fire(&event(&f, &f.sha1, &f.sha2), 100).unwrap_err();
        assert!(matches!(err, Error::UnsupportedKind(kind) if kind == "workflow_dispatch"));
    }

    #[test]
    fn test_non_branch_refs_are_ignored() {
        let f = fixture();
        push_workflow(
            &f,
            "ci.yaml",
            Trigger {
                kind: "push".to_owned(),
                ..Trigger::default()
            },
        );
        let post = f.post();

        let mut ev = event(&f, &f.sha1, &f.sha2);
        ev.ref_name = "refs/pull/1/head".to_owned();
        assert_eq!(post.fire(&ev, 100).unwrap(), Vec::<RunId>::new());
    }
}
