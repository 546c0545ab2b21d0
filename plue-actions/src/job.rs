//! Queued jobs: priorities, requirements and the status machine.
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use plue::identity::UnknownEnum;

use crate::runner::Capabilities;
use crate::store::RunId;

/// Job identifier, unique across the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority, strongest first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Scan order of the sub-queues.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Normal => 2,
            Self::Low => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "critical" => Ok(Self::Critical),
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(UnknownEnum::new("priority", other)),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a job demands of its runner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub architecture: Option<String>,
    /// Minimum memory, in mebibytes.
    #[serde(default)]
    pub min_memory_mb: u64,
    #[serde(default)]
    pub docker: bool,
}

impl Requirements {
    /// Whether a runner with these capabilities can take the job. Labels
    /// are subset-matched: a runner with no labels only satisfies jobs with
    /// no label requirements.
    pub fn satisfied_by(&self, caps: &Capabilities) -> bool {
        self.labels.is_subset(&caps.labels)
            && self
                .architecture
                .as_ref()
                .map_or(true, |arch| *arch == caps.architecture)
            && self.min_memory_mb <= caps.memory_mb
            && (!self.docker || caps.docker)
    }
}

/// Job lifecycle. Terminal states never reopen; a retry is a new job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Held back by unresolved dependencies.
    Pending,
    /// Ready to be handed to a runner.
    Queued,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }

    /// The legal transitions of the status machine.
    pub fn can_transition(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, to),
            (Pending, Queued)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Queued, InProgress)
                | (Queued, Cancelled)
                | (Queued, Failed)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (InProgress, Failed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = UnknownEnum;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownEnum::new("job status", other)),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One unit of work within a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub run: RunId,
    /// Key within the run; dependencies refer to keys of the same run.
    pub key: String,
    pub priority: Priority,
    pub requirements: Requirements,
    pub deps: BTreeSet<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    /// Wall-clock budget once in progress, in seconds.
    pub timeout_secs: u64,
    /// Unix seconds.
    pub enqueued_at: i64,
    pub status: JobStatus,
    /// Failure or cancellation reason, when any.
    pub reason: Option<String>,
}

impl QueuedJob {
    /// A fresh job for the next attempt of this one.
    pub fn retry(&self, now: i64) -> QueuedJob {
        QueuedJob {
            id: JobId(0),
            retry_count: self.retry_count + 1,
            // The original only ran because its dependencies resolved.
            deps: BTreeSet::new(),
            enqueued_at: now,
            status: JobStatus::Queued,
            reason: None,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn caps(labels: &[&str], arch: &str, memory: u64, docker: bool) -> Capabilities {
        Capabilities {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            architecture: arch.to_owned(),
            memory_mb: memory,
            cpus: 4,
            docker,
            max_parallel: 2,
        }
    }

    #[test]
    fn test_label_subset_matching() {
        let mut req = Requirements::default();
        assert!(req.satisfied_by(&caps(&[], "amd64", 1024, false)));

        req.labels = ["linux", "gpu"].iter().map(|s| s.to_string()).collect();
        assert!(!req.satisfied_by(&caps(&["linux"], "amd64", 1024, false)));
        assert!(req.satisfied_by(&caps(&["linux", "gpu", "fast"], "amd64", 1024, false)));

        // A runner with zero labels only matches zero-label jobs.
        assert!(!req.satisfied_by(&caps(&[], "amd64", 1024, false)));
    }

    #[test]
    fn test_architecture_memory_docker() {
        let req = Requirements {
            architecture: Some("arm64".to_owned()),
            min_memory_mb: 2048,
            docker: true,
            ..Requirements::default()
        };
        assert!(req.satisfied_by(&caps(&[], "arm64", 4096, true)));
        assert!(!req.satisfied_by(&caps(&[], "amd64", 4096, true)));
        assert!(!req.satisfied_by(&caps(&[], "arm64", 1024, true)));
        assert!(!req.satisfied_by(&caps(&[], "arm64", 4096, false)));
    }

    #[test]
    fn test_terminal_states_never_reopen() {
        for terminal in [JobStatus::Completed, JobStatus::Cancelled, JobStatus::Failed] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Pending,
                JobStatus::Queued,
                JobStatus::InProgress,
                JobStatus::Completed,
                JobStatus::Cancelled,
                JobStatus::Failed,
            ] {
                assert!(!terminal.can_transition(next));
            }
        }
    }

    #[test]
    fn test_forward_transitions() {
        assert!(JobStatus::Pending.can_transition(JobStatus::Queued));
        assert!(JobStatus::Queued.can_transition(JobStatus::InProgress));
        assert!(JobStatus::InProgress.can_transition(JobStatus::Completed));
        assert!(!JobStatus::Pending.can_transition(JobStatus::InProgress));
        assert!(!JobStatus::InProgress.can_transition(JobStatus::Queued));
    }

    #[test]
    fn test_retry_increments_and_resets() {
        let job = QueuedJob {
            id: JobId(7),
            run: RunId(1),
            key: "build".to_owned(),
            priority: Priority::Normal,
            requirements: Requirements::default(),
            deps: ["setup".to_owned()].into(),
            retry_count: 0,
            max_retries: 3,
            timeout_secs: 600,
            enqueued_at: 100,
            status: JobStatus::Failed,
            reason: Some("runner_lost".to_owned()),
        };
        let retry = job.retry(200);
        assert_eq!(retry.retry_count, 1);
        assert_eq!(retry.status, JobStatus::Queued);
        assert_eq!(retry.enqueued_at, 200);
        assert!(retry.deps.is_empty());
        assert_eq!(retry.reason, None);
        assert_eq!(retry.key, "build");
    }
}
