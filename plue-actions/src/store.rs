//! SQLite persistence for workflows, runs and jobs.
//!
//! `run_number` is assigned inside a single `BEGIN IMMEDIATE` transaction,
//! which makes it strictly increasing and gap-free per (repository,
//! workflow). A run's commit sha and ref are written once at insert and
//! never updated.
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use sqlite::{ConnectionThreadSafe, State};
use thiserror::Error;

use plue::identity::{UnknownEnum, UserId};
use plue::repo::RepoId;

use crate::job::{JobId, JobStatus, QueuedJob};
use crate::runner::RunnerId;
use crate::trigger::{JobSpec, Trigger, Workflow};

/// Workflow identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct WorkflowId(pub i64);

impl fmt::Display for WorkflowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Workflow run identifier.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct RunId(pub i64);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Queued,
    InProgress,
    Completed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for RunStatus {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownEnum::new("run status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunConclusion {
    Success,
    Failure,
    Cancelled,
    TimedOut,
}

impl RunConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Cancelled => "cancelled",
            Self::TimedOut => "timed_out",
        }
    }
}

impl FromStr for RunConclusion {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            "cancelled" => Ok(Self::Cancelled),
            "timed_out" => Ok(Self::TimedOut),
            other => Err(UnknownEnum::new("run conclusion", other)),
        }
    }
}

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowRun {
    pub id: RunId,
    pub workflow: WorkflowId,
    pub repo: RepoId,
    /// Strictly increasing per (repo, workflow).
    pub run_number: i64,
    /// Snapshot of what fired the run.
    pub trigger: serde_json::Value,
    pub sha: String,
    pub ref_name: String,
    pub actor: UserId,
    pub status: RunStatus,
    pub conclusion: Option<RunConclusion>,
    pub created_at: i64,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Sqlite(#[from] sqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    UnknownEnum(#[from] UnknownEnum),
}

const SCHEMA: &str = "
  CREATE TABLE IF NOT EXISTS workflows (
    id       INTEGER PRIMARY KEY AUTOINCREMENT,
    repo     INTEGER NOT NULL,
    filename TEXT NOT NULL,
    triggers TEXT NOT NULL,
    jobs     TEXT NOT NULL,
    UNIQUE (repo, filename)
  );
  CREATE TABLE IF NOT EXISTS runs (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    workflow   INTEGER NOT NULL REFERENCES workflows (id),
    repo       INTEGER NOT NULL,
    run_number INTEGER NOT NULL,
    trigger    TEXT NOT NULL,
    sha        TEXT NOT NULL,
    ref_name   TEXT NOT NULL,
    actor      INTEGER NOT NULL,
    status     TEXT NOT NULL,
    conclusion TEXT,
    created_at INTEGER NOT NULL,
    UNIQUE (repo, workflow, run_number)
  );
  CREATE TABLE IF NOT EXISTS jobs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    run             INTEGER NOT NULL REFERENCES runs (id),
    key             TEXT NOT NULL,
    priority        TEXT NOT NULL,
    requirements    TEXT NOT NULL,
    deps            TEXT NOT NULL,
    retry_count     INTEGER NOT NULL DEFAULT 0,
    max_retries     INTEGER NOT NULL DEFAULT 0,
    timeout_secs    INTEGER NOT NULL,
    enqueued_at     INTEGER NOT NULL,
    status          TEXT NOT NULL,
    reason          TEXT,
    assigned_runner INTEGER
  );
";

/// Actions persistence.
pub struct Store {
    db: ConnectionThreadSafe,
}

impl Store {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, Error> {
        let db = sqlite::Connection::open_thread_safe(path)?;
        db.execute("PRAGMA foreign_keys = ON")?;
        db.execute(SCHEMA)?;
        Ok(Self { db })
    }

    pub fn memory() -> Result<Self, Error> {
        Self::open(":memory:")
    }

    fn last_id(&self) -> Result<i64, Error> {
        let mut stmt = self.db.prepare("SELECT last_insert_rowid()")?;
        stmt.next()?;
        Ok(stmt.read::<i64, _>(0)?)
    }

    ////////////////////////////////////////////////////////////////////////
    // Workflows.
    ////////////////////////////////////////////////////////////////////////

    /// Store (or replace) a workflow descriptor produced by the external
    /// parser.
    pub fn upsert_workflow(
        &self,
        repo: RepoId,
        filename: &str,
        triggers: &[Trigger],
        jobs: &BTreeMap<String, JobSpec>,
    ) -> Result<WorkflowId, Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO workflows (repo, filename, triggers, jobs) VALUES (?, ?, ?, ?)
             ON CONFLICT (repo, filename) DO UPDATE SET triggers = excluded.triggers,
                                                        jobs = excluded.jobs",
        )?;
        stmt.bind((1, repo.0))?;
        stmt.bind((2, filename))?;
        stmt.bind((3, serde_json::to_string(triggers)?.as_str()))?;
        stmt.bind((4, serde_json::to_string(jobs)?.as_str()))?;
        stmt.next()?;

        let mut stmt = self
            .db
            .prepare("SELECT id FROM workflows WHERE repo = ? AND filename = ?")?;
        stmt.bind((1, repo.0))?;
        stmt.bind((2, filename))?;
        stmt.next()?;
        Ok(WorkflowId(stmt.read::<i64, _>(0)?))
    }

    pub fn workflows_for(&self, repo: RepoId) -> Result<Vec<Workflow>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT id, repo, filename, triggers, jobs FROM workflows WHERE repo = ?")?;
        stmt.bind((1, repo.0))?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            out.push(Workflow {
                id: WorkflowId(stmt.read::<i64, _>(0)?),
                repo: RepoId(stmt.read::<i64, _>(1)?),
                filename: stmt.read::<String, _>(2)?,
                triggers: serde_json::from_str(&stmt.read::<String, _>(3)?)?,
                jobs: serde_json::from_str(&stmt.read::<String, _>(4)?)?,
            });
        }
        Ok(out)
    }

    ////////////////////////////////////////////////////////////////////////
    // Runs.
    ////////////////////////////////////////////////////////////////////////

    /// Create a run, assigning the next `run_number` atomically.
    #[allow(clippy::too_many_arguments)]
    pub fn create_run(
        &self,
        workflow: WorkflowId,
        repo: RepoId,
        trigger: &serde_json::Value,
        sha: &str,
        ref_name: &str,
        actor: UserId,
        now: i64,
    ) -> Result<WorkflowRun, Error> {
        self.db.execute("BEGIN IMMEDIATE")?;
        let result = (|| -> Result<WorkflowRun, Error> {
            let mut stmt = self.db.prepare(
                "SELECT COALESCE(MAX(run_number), 0) + 1 FROM runs
                 WHERE repo = ? AND workflow = ?",
            )?;
            stmt.bind((1, repo.0))?;
            stmt.bind((2, workflow.0))?;
            stmt.next()?;
            let run_number = stmt.read::<i64, _>(0)?;

            let mut stmt = self.db.prepare(
                "INSERT INTO runs (workflow, repo, run_number, trigger, sha, ref_name,
                                   actor, status, conclusion, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, 'queued', NULL, ?)",
            )?;
            stmt.bind((1, workflow.0))?;
            stmt.bind((2, repo.0))?;
            stmt.bind((3, run_number))?;
            stmt.bind((4, serde_json::to_string(trigger)?.as_str()))?;
            stmt.bind((5, sha))?;
            stmt.bind((6, ref_name))?;
            stmt.bind((7, actor.0))?;
            stmt.bind((8, now))?;
            stmt.next()?;

            Ok(WorkflowRun {
                id: RunId(self.last_id()?),
                workflow,
                repo,
                run_number,
                trigger: trigger.clone(),
                sha: sha.to_owned(),
                ref_name: ref_name.to_owned(),
                actor,
                status: RunStatus::Queued,
                conclusion: None,
                created_at: now,
            })
        })();
        match result {
            Ok(run) => {
                self.db.execute("COMMIT")?;
                Ok(run)
            }
            Err(err) => {
                self.db.execute("ROLLBACK").ok();
                Err(err)
            }
        }
    }

    pub fn run(&self, id: RunId) -> Result<Option<WorkflowRun>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, workflow, repo, run_number, trigger, sha, ref_name, actor,
                    status, conclusion, created_at
             FROM runs WHERE id = ?",
        )?;
        stmt.bind((1, id.0))?;
        if stmt.next()? == State::Row {
            Ok(Some(read_run(&stmt)?))
        } else {
            Ok(None)
        }
    }

    /// Runs of a repository in `run_number` order.
    pub fn runs_for(&self, repo: RepoId) -> Result<Vec<WorkflowRun>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, workflow, repo, run_number, trigger, sha, ref_name, actor,
                    status, conclusion, created_at
             FROM runs WHERE repo = ? ORDER BY workflow, run_number",
        )?;
        stmt.bind((1, repo.0))?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            out.push(read_run(&stmt)?);
        }
        Ok(out)
    }

    /// Update status and conclusion; the sha and ref are immutable.
    pub fn set_run_status(
        &self,
        id: RunId,
        status: RunStatus,
        conclusion: Option<RunConclusion>,
    ) -> Result<(), Error> {
        let mut stmt = self
            .db
            .prepare("UPDATE runs SET status = ?, conclusion = ? WHERE id = ?")?;
        stmt.bind((1, status.as_str()))?;
        stmt.bind((2, conclusion.map(|c| c.as_str())))?;
        stmt.bind((3, id.0))?;
        stmt.next()?;
        Ok(())
    }

    ////////////////////////////////////////////////////////////////////////
    // Jobs.
    ////////////////////////////////////////////////////////////////////////

    pub fn insert_job(&self, job: &QueuedJob) -> Result<JobId, Error> {
        let mut stmt = self.db.prepare(
            "INSERT INTO jobs (run, key, priority, requirements, deps, retry_count,
                               max_retries, timeout_secs, enqueued_at, status, reason)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )?;
        stmt.bind((1, job.run.0))?;
        stmt.bind((2, job.key.as_str()))?;
        stmt.bind((3, job.priority.as_str()))?;
        stmt.bind((4, serde_json::to_string(&job.requirements)?.as_str()))?;
        stmt.bind((5, serde_json::to_string(&job.deps)?.as_str()))?;
        stmt.bind((6, i64::from(job.retry_count)))?;
        stmt.bind((7, i64::from(job.max_retries)))?;
        stmt.bind((8, job.timeout_secs as i64))?;
        stmt.bind((9, job.enqueued_at))?;
        stmt.bind((10, job.status.as_str()))?;
        stmt.bind((11, job.reason.as_deref()))?;
        stmt.next()?;
        Ok(JobId(self.last_id()?))
    }

    /// Persist a job's status, reason and assignment. Called inside the
    /// dispatcher's critical section, before any response is sent.
    pub fn update_job(
        &self,
        id: JobId,
        status: JobStatus,
        reason: Option<&str>,
        assigned: Option<RunnerId>,
    ) -> Result<(), Error> {
        let mut stmt = self.db.prepare(
            "UPDATE jobs SET status = ?, reason = ?, assigned_runner = ? WHERE id = ?",
        )?;
        stmt.bind((1, status.as_str()))?;
        stmt.bind((2, reason))?;
        stmt.bind((3, assigned.map(|r| r.0)))?;
        stmt.bind((4, id.0))?;
        stmt.next()?;
        Ok(())
    }

    pub fn job(&self, id: JobId) -> Result<Option<(QueuedJob, Option<RunnerId>)>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, run, key, priority, requirements, deps, retry_count, max_retries,
                    timeout_secs, enqueued_at, status, reason, assigned_runner
             FROM jobs WHERE id = ?",
        )?;
        stmt.bind((1, id.0))?;
        if stmt.next()? == State::Row {
            Ok(Some(read_job(&stmt)?))
        } else {
            Ok(None)
        }
    }

    /// All non-terminal jobs, for restart recovery.
    pub fn open_jobs(&self) -> Result<Vec<(QueuedJob, Option<RunnerId>)>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, run, key, priority, requirements, deps, retry_count, max_retries,
                    timeout_secs, enqueued_at, status, reason, assigned_runner
             FROM jobs WHERE status IN ('pending', 'queued', 'in_progress')
             ORDER BY enqueued_at, id",
        )?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            out.push(read_job(&stmt)?);
        }
        Ok(out)
    }

    /// Jobs belonging to a run, for dependency evaluation.
    pub fn jobs_for_run(&self, run: RunId) -> Result<Vec<QueuedJob>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, run, key, priority, requirements, deps, retry_count, max_retries,
                    timeout_secs, enqueued_at, status, reason, assigned_runner
             FROM jobs WHERE run = ? ORDER BY id",
        )?;
        stmt.bind((1, run.0))?;
        let mut out = Vec::new();
        while stmt.next()? == State::Row {
            out.push(read_job(&stmt)?.0);
        }
        Ok(out)
    }
}

fn read_run(stmt: &sqlite::Statement<'_>) -> Result<WorkflowRun, Error> {
    Ok(WorkflowRun {
        id: RunId(stmt.read::<i64, _>(0)?),
        workflow: WorkflowId(stmt.read::<i64, _>(1)?),
        repo: RepoId(stmt.read::<i64, _>(2)?),
        run_number: stmt.read::<i64, _>(3)?,
        trigger: serde_json::from_str(&stmt.read::<String, _>(4)?)?,
        sha: stmt.read::<String, _>(5)?,
        ref_name: stmt.read::<String, _>(6)?,
        actor: UserId(stmt.read::<i64, _>(7)?),
        status: stmt.read::<String, _>(8)?.parse()?,
        conclusion: stmt
            .read::<Option<String>, _>(9)?
            .map(|s| s.parse())
            .transpose()?,
        created_at: stmt.read::<i64, _>(10)?,
    })
}

fn read_job(stmt: &sqlite::Statement<'_>) -> Result<(QueuedJob, Option<RunnerId>), Error> {
    let job = QueuedJob {
        id: JobId(stmt.read::<i64, _>(0)?),
        run: RunId(stmt.read::<i64, _>(1)?),
        key: stmt.read::<String, _>(2)?,
        priority: stmt.read::<String, _>(3)?.parse()?,
        requirements: serde_json::from_str(&stmt.read::<String, _>(4)?)?,
        deps: serde_json::from_str(&stmt.read::<String, _>(5)?)?,
        retry_count: stmt.read::<i64, _>(6)? as u32,
        max_retries: stmt.read::<i64, _>(7)? as u32,
        timeout_secs: stmt.read::<i64, _>(8)? as u64,
        enqueued_at: stmt.read::<i64, _>(9)?,
        status: stmt.read::<String, _>(10)?.parse()?,
        reason: stmt.read::<Option<String>, _>(11)?,
    };
    let assigned = stmt.read::<Option<i64>, _>(12)?.map(RunnerId);
    Ok((job, assigned))
}
