//! Runner selection policies.
//!
//! When a job becomes ready the dispatcher picks one candidate runner to
//! nudge. `LeastLoaded` picks the runner with the lowest load fraction;
//! `RoundRobin` cycles through candidates.
use serde::{Deserialize, Serialize};

use crate::runner::{Runner, RunnerId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentPolicy {
    #[default]
    LeastLoaded,
    RoundRobin,
}

/// Mutable policy bookkeeping owned by the dispatcher.
#[derive(Debug, Default)]
pub struct PolicyState {
    cursor: usize,
}

impl AssignmentPolicy {
    /// Pick one of the candidate runners. Candidates are expected to be
    /// pre-filtered for status, capacity and requirements.
    pub fn select(&self, state: &mut PolicyState, candidates: &[&Runner]) -> Option<RunnerId> {
        if candidates.is_empty() {
            return None;
        }
        match self {
            Self::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| {
                    a.load()
                        .partial_cmp(&b.load())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.id.cmp(&b.id))
                })
                .map(|r| r.id),
            Self::RoundRobin => {
                let picked = candidates[state.cursor % candidates.len()].id;
                state.cursor = state.cursor.wrapping_add(1);
                Some(picked)
            }
        }
    }
}
