//! Runner records and the label-indexed registry.
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::job::Requirements;

/// Runner identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunnerId(pub i64);

impl fmt::Display for RunnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerStatus {
    Online,
    Offline,
    Busy,
}

/// Capability snapshot a runner sends with every poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub architecture: String,
    pub memory_mb: u64,
    pub cpus: u32,
    #[serde(default)]
    pub docker: bool,
    pub max_parallel: u32,
}

/// A registered runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Runner {
    pub id: RunnerId,
    pub name: String,
    pub capabilities: Capabilities,
    pub current_jobs: u32,
    pub status: RunnerStatus,
    /// Unix seconds of the last poll or heartbeat.
    pub last_seen: i64,
}

impl Runner {
    pub fn new(id: RunnerId, name: impl Into<String>, capabilities: Capabilities, now: i64) -> Self {
        Self {
            id,
            name: name.into(),
            capabilities,
            current_jobs: 0,
            status: RunnerStatus::Online,
            last_seen: now,
        }
    }

    pub fn at_capacity(&self) -> bool {
        self.current_jobs >= self.capabilities.max_parallel
    }

    /// Load as a fraction of capacity, for the least-loaded policy.
    pub fn load(&self) -> f64 {
        if self.capabilities.max_parallel == 0 {
            return 1.0;
        }
        f64::from(self.current_jobs) / f64::from(self.capabilities.max_parallel)
    }
}

/// Registry of known runners, indexed by id and by label for candidate
/// lookup.
#[derive(Debug, Default)]
pub struct Registry {
    runners: HashMap<RunnerId, Runner>,
    by_label: HashMap<String, HashSet<RunnerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a runner, keeping the label index in sync.
    pub fn upsert(&mut self, runner: Runner) {
        if let Some(old) = self.runners.get(&runner.id) {
            for label in &old.capabilities.labels {
                if let Some(ids) = self.by_label.get_mut(label) {
                    ids.remove(&runner.id);
                    if ids.is_empty() {
                        self.by_label.remove(label);
                    }
                }
            }
        }
        for label in &runner.capabilities.labels {
            self.by_label
                .entry(label.clone())
                .or_default()
                .insert(runner.id);
        }
        self.runners.insert(runner.id, runner);
    }

    pub fn remove(&mut self, id: RunnerId) -> Option<Runner> {
        let runner = self.runners.remove(&id)?;
        for label in &runner.capabilities.labels {
            if let Some(ids) = self.by_label.get_mut(label) {
                ids.remove(&id);
                if ids.is_empty() {
                    self.by_label.remove(label);
                }
            }
        }
        Some(runner)
    }

    pub fn get(&self, id: RunnerId) -> Option<&Runner> {
        self.runners.get(&id)
    }

    pub fn get_mut(&mut self, id: RunnerId) -> Option<&mut Runner> {
        self.runners.get_mut(&id)
    }

    pub fn contains(&self, id: RunnerId) -> bool {
        self.runners.contains_key(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Runner> {
        self.runners.values()
    }

    pub fn len(&self) -> usize {
        self.runners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runners.is_empty()
    }

    /// Online runners able to take a job with these requirements right now.
    /// Uses the label index to narrow the scan when the job names labels.
    pub fn candidates(&self, requirements: &Requirements) -> Vec<RunnerId> {
        let mut ids: Vec<RunnerId> = match requirements.labels.iter().next() {
            Some(first) => {
                let mut set: HashSet<RunnerId> =
                    self.by_label.get(first).cloned().unwrap_or_default();
                for label in requirements.labels.iter().skip(1) {
                    match self.by_label.get(label) {
                        Some(ids) => set.retain(|id| ids.contains(id)),
                        None => return Vec::new(),
                    }
                }
                set.into_iter().collect()
            }
            None => self.runners.keys().copied().collect(),
        };
        ids.retain(|id| {
            self.runners.get(id).is_some_and(|r| {
                r.status == RunnerStatus::Online
                    && !r.at_capacity()
                    && requirements.satisfied_by(&r.capabilities)
            })
        });
        ids.sort();
        ids
    }
}
