//! The job dispatcher.
//!
//! All queue, registry and assignment mutations happen under one mutex, and
//! every persistence write happens inside that critical section before the
//! response is returned, which makes `poll` linearizable: once a job is
//! handed to a runner, no other runner can observe it as queued.
use std::collections::{HashMap, HashSet};
use std::collections::BTreeMap;
use std::sync::Mutex;

use crossbeam_channel as chan;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::{JobId, JobStatus, QueuedJob};
use crate::policy::{AssignmentPolicy, PolicyState};
use crate::queue::PriorityQueue;
use crate::runner::{Capabilities, Registry, Runner, RunnerId, RunnerStatus};
use crate::store::{self, RunConclusion, RunId, RunStatus, Store};

/// Failure reason recorded when a runner disappears mid-job.
pub const REASON_RUNNER_LOST: &str = "runner_lost";
/// Failure reason recorded when a job exceeds its own timeout.
pub const REASON_TIMEOUT: &str = "timeout";
/// Failure reason recorded when a dependency concluded without success.
pub const REASON_DEPENDENCY_FAILED: &str = "dependency_failed";
/// Cancellation reason recorded when a runner never acknowledged an abort.
pub const REASON_ABORT_TIMEOUT: &str = "abort_timeout";

/// When is a dependency considered resolved.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// The depended-on job must conclude successfully; any other terminal
    /// conclusion permanently blocks dependents.
    #[default]
    Success,
    /// Any terminal conclusion resolves the dependency.
    CompletedRegardless,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub policy: AssignmentPolicy,
    pub dependency_policy: DependencyPolicy,
    /// Expected runner heartbeat cadence, in seconds.
    pub heartbeat_interval: i64,
    /// Heartbeats missed before a runner is declared lost.
    pub missed_heartbeats: u32,
    /// How long to wait for a runner to acknowledge an abort, in seconds.
    pub abort_timeout: i64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            policy: AssignmentPolicy::default(),
            dependency_policy: DependencyPolicy::default(),
            heartbeat_interval: 30,
            missed_heartbeats: 3,
            abort_timeout: 30,
        }
    }
}

/// How a runner reports a finished (or aborted) job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { reason: String },
    /// Acknowledgement of a requested abort.
    Cancelled,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("unknown runner {0}")]
    UnknownRunner(RunnerId),
    #[error("job {job} cannot move from {from} to {to}")]
    InvalidTransition {
        job: JobId,
        from: JobStatus,
        to: JobStatus,
    },
}

/// Point-in-time dispatcher statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    /// Queued depth per priority, critical first.
    pub queue_depths: [usize; 4],
    /// Age of the oldest queued job, in seconds.
    pub oldest_job_age: Option<i64>,
    /// Mean queued-to-started wait of assigned jobs, in seconds.
    pub average_wait: Option<f64>,
    /// Load fraction per registered runner.
    pub utilization: BTreeMap<RunnerId, f64>,
}

#[derive(Debug, Default)]
struct State {
    jobs: HashMap<JobId, QueuedJob>,
    queue: PriorityQueue,
    registry: Registry,
    /// Job → (runner, started_at).
    assignments: HashMap<JobId, (RunnerId, i64)>,
    /// Abort requests awaiting delivery, per runner.
    pending_aborts: HashMap<RunnerId, HashSet<JobId>>,
    /// Job → abort request time.
    abort_deadlines: HashMap<JobId, i64>,
    subscriptions: HashMap<RunnerId, chan::Sender<()>>,
    policy: PolicyState,
    wait_sum: i64,
    wait_count: u64,
}

enum DepState {
    Ready,
    Waiting,
    Blocked,
}

/// The dispatcher. Cheap to share behind an `Arc`; all methods take `&self`.
pub struct Dispatcher {
    store: Store,
    config: DispatchConfig,
    state: Mutex<State>,
}

impl Dispatcher {
    pub fn new(store: Store, config: DispatchConfig) -> Self {
        Self {
            store,
            config,
            state: Mutex::new(State::default()),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Load persisted non-terminal jobs after a restart. Jobs that were in
    /// progress on runners that are no longer registered go back to the
    /// queue.
    pub fn recover(&self, now: i64) -> Result<usize, Error> {
        let mut state = self.lock();
        let open = self.store.open_jobs()?;
        let count = open.len();
        for (mut job, assigned) in open {
            match job.status {
                JobStatus::Pending => {}
                JobStatus::Queued => state.queue.push(job.priority, job.id),
                JobStatus::InProgress => match assigned {
                    Some(runner) if state.registry.contains(runner) => {
                        state.assignments.insert(job.id, (runner, now));
                    }
                    _ => {
                        log::info!(
                            target: "dispatch",
                            "Recovering job {} from lost assignment; back to queue",
                            job.id
                        );
                        job.status = JobStatus::Queued;
                        self.store
                            .update_job(job.id, JobStatus::Queued, None, None)?;
                        state.queue.push(job.priority, job.id);
                    }
                },
                _ => continue,
            }
            state.jobs.insert(job.id, job);
        }
        log::info!(target: "dispatch", "Recovered {count} open job(s)");
        Ok(count)
    }

    /// Register or refresh a runner explicitly.
    pub fn register(&self, runner: Runner) {
        let mut state = self.lock();
        log::debug!(target: "dispatch", "Runner {} ({}) registered", runner.id, runner.name);
        state.registry.upsert(runner);
    }

    /// Subscribe to assignment nudges for a runner. The dispatcher sends a
    /// unit on the channel when a job this runner could take becomes ready.
    pub fn subscribe(&self, runner: RunnerId) -> chan::Receiver<()> {
        let (tx, rx) = chan::bounded(1);
        self.lock().subscriptions.insert(runner, tx);
        rx
    }

    /// Enqueue a batch of jobs belonging to one run. Ids on the input jobs
    /// are ignored; assigned ids are returned in order.
    pub fn enqueue(&self, jobs: Vec<QueuedJob>, now: i64) -> Result<Vec<JobId>, Error> {
        let mut state = self.lock();
        let mut ids = Vec::with_capacity(jobs.len());
        let mut runs = HashSet::new();
        for mut job in jobs {
            job.status = JobStatus::Pending;
            job.enqueued_at = now;
            job.id = self.store.insert_job(&job)?;
            runs.insert(job.run);
            ids.push(job.id);
            log::debug!(
                target: "dispatch",
                "Enqueued job {} `{}` of run {} at {} priority",
                job.id,
                job.key,
                job.run,
                job.priority
            );
            state.jobs.insert(job.id, job);
        }
        for run in runs {
            self.reevaluate_run(&mut state, run)?;
        }
        Ok(ids)
    }

    /// Runner-pulled assignment. Updates the runner snapshot, then scans
    /// the sub-queues in priority order for the first job this runner can
    /// take. The transition is persisted before the job is returned.
    pub fn poll(
        &self,
        runner: RunnerId,
        name: &str,
        capabilities: Capabilities,
        now: i64,
    ) -> Result<Option<QueuedJob>, Error> {
        let mut state = self.lock();
        self.refresh_runner(&mut state, runner, name, capabilities, now);

        let picked = {
            let registry_runner = state.registry.get(runner).ok_or(Error::UnknownRunner(runner))?;
            if registry_runner.at_capacity() {
                None
            } else {
                state.queue.iter().find(|id| {
                    state.jobs.get(id).is_some_and(|job| {
                        job.status == JobStatus::Queued
                            && job
                                .requirements
                                .satisfied_by(&registry_runner.capabilities)
                    })
                })
            }
        };
        let Some(id) = picked else {
            return Ok(None);
        };

        // Persist before responding; a crash here leaves the job assigned,
        // and recovery re-queues it if the runner is gone.
        self.store
            .update_job(id, JobStatus::InProgress, None, Some(runner))?;

        state.queue.remove(id);
        let job = state.jobs.get_mut(&id).ok_or(Error::UnknownJob(id))?;
        job.status = JobStatus::InProgress;
        let wait = now.saturating_sub(job.enqueued_at);
        let run = job.run;
        let job = job.clone();

        state.wait_sum += wait;
        state.wait_count += 1;
        state.assignments.insert(id, (runner, now));
        if let Some(r) = state.registry.get_mut(runner) {
            r.current_jobs += 1;
            debug_assert!(r.current_jobs <= r.capabilities.max_parallel);
            if r.at_capacity() {
                r.status = RunnerStatus::Busy;
            }
        }
        if let Ok(Some(record)) = self.store.run(run) {
            if record.status == RunStatus::Queued {
                self.store.set_run_status(run, RunStatus::InProgress, None)?;
            }
        }
        log::debug!(target: "dispatch", "Job {id} assigned to runner {runner}");
        Ok(Some(job))
    }

    /// Runner liveness signal; returns jobs the runner must abort.
    pub fn heartbeat(&self, runner: RunnerId, now: i64) -> Result<Vec<JobId>, Error> {
        let mut state = self.lock();
        let r = state
            .registry
            .get_mut(runner)
            .ok_or(Error::UnknownRunner(runner))?;
        r.last_seen = now;
        if r.status == RunnerStatus::Offline {
            r.status = RunnerStatus::Online;
        }
        let mut aborts: Vec<JobId> = state
            .pending_aborts
            .remove(&runner)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        aborts.sort();
        Ok(aborts)
    }

    /// A runner reports the outcome of a job it was assigned.
    pub fn update_status(&self, id: JobId, outcome: JobOutcome, now: i64) -> Result<(), Error> {
        let mut state = self.lock();
        let job = state.jobs.get(&id).ok_or(Error::UnknownJob(id))?.clone();

        let target = match &outcome {
            JobOutcome::Completed => JobStatus::Completed,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        };
        if !job.status.can_transition(target) {
            return Err(Error::InvalidTransition {
                job: id,
                from: job.status,
                to: target,
            });
        }

        self.release_assignment(&mut state, id);
        match outcome {
            JobOutcome::Completed => {
                self.store.update_job(id, JobStatus::Completed, None, None)?;
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Completed;
                }
                log::debug!(target: "dispatch", "Job {id} completed");
            }
            JobOutcome::Failed { reason } => {
                self.fail_job(&mut state, id, &reason, now, true)?;
            }
            JobOutcome::Cancelled => {
                self.store
                    .update_job(id, JobStatus::Cancelled, job.reason.as_deref(), None)?;
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Cancelled;
                }
                state.abort_deadlines.remove(&id);
                log::debug!(target: "dispatch", "Job {id} cancelled (acknowledged)");
            }
        }
        self.reevaluate_run(&mut state, job.run)
    }

    /// Cancel a job in any non-terminal state. In-progress jobs are asked
    /// to abort and stay in progress until acknowledgement or the abort
    /// timeout.
    pub fn cancel(&self, id: JobId, now: i64) -> Result<(), Error> {
        let mut state = self.lock();
        let job = state.jobs.get(&id).ok_or(Error::UnknownJob(id))?.clone();
        match job.status {
            JobStatus::Pending | JobStatus::Queued => {
                self.store
                    .update_job(id, JobStatus::Cancelled, Some("cancelled"), None)?;
                state.queue.remove(id);
                if let Some(job) = state.jobs.get_mut(&id) {
                    job.status = JobStatus::Cancelled;
                    job.reason = Some("cancelled".to_owned());
                }
                log::debug!(target: "dispatch", "Job {id} cancelled while {}", job.status);
                self.reevaluate_run(&mut state, job.run)
            }
            JobStatus::InProgress => {
                let (runner, _) = *state.assignments.get(&id).ok_or(Error::UnknownJob(id))?;
                state.pending_aborts.entry(runner).or_default().insert(id);
                state.abort_deadlines.insert(id, now);
                log::debug!(target: "dispatch", "Abort of job {id} requested from runner {runner}");
                Ok(())
            }
            status => Err(Error::InvalidTransition {
                job: id,
                from: status,
                to: JobStatus::Cancelled,
            }),
        }
    }

    /// Periodic sweep: declare silent runners lost (failing their jobs with
    /// a retry), enforce job timeouts, and force-cancel aborts that were
    /// never acknowledged.
    pub fn tick(&self, now: i64) -> Result<(), Error> {
        let mut state = self.lock();
        let cutoff = now - self.config.heartbeat_interval * i64::from(self.config.missed_heartbeats);

        let lost: Vec<RunnerId> = state
            .registry
            .iter()
            .filter(|r| r.status != RunnerStatus::Offline && r.last_seen < cutoff)
            .map(|r| r.id)
            .collect();
        let mut touched_runs = HashSet::new();
        for runner in lost {
            log::warn!(target: "dispatch", "Runner {runner} missed its heartbeats; marking offline");
            if let Some(r) = state.registry.get_mut(runner) {
                r.status = RunnerStatus::Offline;
            }
            let orphaned: Vec<JobId> = state
                .assignments
                .iter()
                .filter(|(_, (r, _))| *r == runner)
                .map(|(job, _)| *job)
                .collect();
            for id in orphaned {
                self.release_assignment(&mut state, id);
                if let Some(run) = state.jobs.get(&id).map(|j| j.run) {
                    touched_runs.insert(run);
                }
                self.fail_job(&mut state, id, REASON_RUNNER_LOST, now, true)?;
            }
        }

        let timed_out: Vec<(JobId, RunnerId)> = state
            .assignments
            .iter()
            .filter(|(job, (_, started))| {
                state
                    .jobs
                    .get(job)
                    .is_some_and(|j| now - started >= j.timeout_secs as i64)
            })
            .map(|(job, (runner, _))| (*job, *runner))
            .collect();
        for (id, runner) in timed_out {
            log::warn!(target: "dispatch", "Job {id} exceeded its timeout on runner {runner}");
            self.release_assignment(&mut state, id);
            state.pending_aborts.entry(runner).or_default().insert(id);
            if let Some(run) = state.jobs.get(&id).map(|j| j.run) {
                touched_runs.insert(run);
            }
            self.fail_job(&mut state, id, REASON_TIMEOUT, now, true)?;
        }

        let expired: Vec<JobId> = state
            .abort_deadlines
            .iter()
            .filter(|(_, requested)| now - **requested >= self.config.abort_timeout)
            .map(|(job, _)| *job)
            .collect();
        for id in expired {
            state.abort_deadlines.remove(&id);
            if state.jobs.get(&id).map(|j| j.status) != Some(JobStatus::InProgress) {
                continue;
            }
            log::warn!(target: "dispatch", "Abort of job {id} timed out; forcing cancellation");
            self.release_assignment(&mut state, id);
            self.store
                .update_job(id, JobStatus::Cancelled, Some(REASON_ABORT_TIMEOUT), None)?;
            if let Some(job) = state.jobs.get_mut(&id) {
                job.status = JobStatus::Cancelled;
                job.reason = Some(REASON_ABORT_TIMEOUT.to_owned());
                touched_runs.insert(job.run);
            }
        }

        for run in touched_runs {
            self.reevaluate_run(&mut state, run)?;
        }
        Ok(())
    }

    /// Drop terminal jobs enqueued before `before` from memory; the store
    /// keeps them for audit.
    pub fn purge_terminal(&self, before: i64) {
        let mut state = self.lock();
        state
            .jobs
            .retain(|_, job| !job.status.is_terminal() || job.enqueued_at >= before);
    }

    pub fn metrics(&self, now: i64) -> Metrics {
        let state = self.lock();
        let oldest = state
            .queue
            .iter()
            .filter_map(|id| state.jobs.get(&id))
            .map(|job| now.saturating_sub(job.enqueued_at))
            .max();
        let average_wait = if state.wait_count > 0 {
            Some(state.wait_sum as f64 / state.wait_count as f64)
        } else {
            None
        };
        Metrics {
            queue_depths: state.queue.depths(),
            oldest_job_age: oldest,
            average_wait,
            utilization: state
                .registry
                .iter()
                .map(|r| (r.id, r.load()))
                .collect(),
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Internals. All of these run with the state lock held.
    ////////////////////////////////////////////////////////////////////////

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().expect("dispatch: state lock poisoned")
    }

    fn refresh_runner(
        &self,
        state: &mut State,
        id: RunnerId,
        name: &str,
        capabilities: Capabilities,
        now: i64,
    ) {
        let runner = match state.registry.get(id) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.name = name.to_owned();
                updated.capabilities = capabilities;
                updated.last_seen = now;
                if updated.status == RunnerStatus::Offline {
                    updated.status = RunnerStatus::Online;
                }
                updated
            }
            None => Runner::new(id, name, capabilities, now),
        };
        state.registry.upsert(runner);
    }

    fn release_assignment(&self, state: &mut State, id: JobId) {
        if let Some((runner, _)) = state.assignments.remove(&id) {
            if let Some(r) = state.registry.get_mut(runner) {
                r.current_jobs = r.current_jobs.saturating_sub(1);
                if r.status == RunnerStatus::Busy && !r.at_capacity() {
                    r.status = RunnerStatus::Online;
                }
            }
        }
    }

    /// Mark a job failed and spawn its retry if attempts remain. Does not
    /// reevaluate the run; callers do that once.
    fn fail_job(
        &self,
        state: &mut State,
        id: JobId,
        reason: &str,
        now: i64,
        retry: bool,
    ) -> Result<(), Error> {
        self.store
            .update_job(id, JobStatus::Failed, Some(reason), None)?;
        let job = match state.jobs.get_mut(&id) {
            Some(job) => {
                job.status = JobStatus::Failed;
                job.reason = Some(reason.to_owned());
                job.clone()
            }
            None => return Err(Error::UnknownJob(id)),
        };
        log::debug!(target: "dispatch", "Job {id} failed: {reason}");

        if retry && job.retry_count < job.max_retries {
            let mut attempt = job.retry(now);
            attempt.id = self.store.insert_job(&attempt)?;
            log::info!(
                target: "dispatch",
                "Retrying job {} as {} (attempt {}/{})",
                id,
                attempt.id,
                attempt.retry_count,
                attempt.max_retries
            );
            state.queue.push(attempt.priority, attempt.id);
            let requirements = attempt.requirements.clone();
            state.jobs.insert(attempt.id, attempt);
            self.nudge(state, &requirements);
        }
        Ok(())
    }

    /// Promote pending jobs whose dependencies resolved, fail those whose
    /// dependencies are permanently blocked, and conclude the run when all
    /// its jobs are terminal.
    fn reevaluate_run(&self, state: &mut State, run: RunId) -> Result<(), Error> {
        loop {
            let pending: Vec<JobId> = state
                .jobs
                .values()
                .filter(|j| j.run == run && j.status == JobStatus::Pending)
                .map(|j| j.id)
                .collect();
            let mut changed = false;
            for id in pending {
                let Some(job) = state.jobs.get(&id) else {
                    continue;
                };
                match self.dependency_state(state, job) {
                    DepState::Ready => {
                        self.store.update_job(id, JobStatus::Queued, None, None)?;
                        let (priority, requirements) = {
                            let job = state.jobs.get_mut(&id).ok_or(Error::UnknownJob(id))?;
                            job.status = JobStatus::Queued;
                            (job.priority, job.requirements.clone())
                        };
                        state.queue.push(priority, id);
                        self.nudge(state, &requirements);
                        log::debug!(target: "dispatch", "Job {id} is ready");
                        changed = true;
                    }
                    DepState::Blocked => {
                        self.fail_job(state, id, REASON_DEPENDENCY_FAILED, 0, false)?;
                        changed = true;
                    }
                    DepState::Waiting => {}
                }
            }
            if !changed {
                break;
            }
        }
        self.finalize_run(state, run)
    }

    /// Evaluate a pending job's dependencies against the latest attempt of
    /// each depended-on key.
    fn dependency_state(&self, state: &State, job: &QueuedJob) -> DepState {
        let mut waiting = false;
        for dep in &job.deps {
            let latest = state
                .jobs
                .values()
                .filter(|j| j.run == job.run && j.key == *dep)
                .max_by_key(|j| j.retry_count);
            let Some(latest) = latest else {
                // Dangling dependency key; it can never resolve.
                log::warn!(
                    target: "dispatch",
                    "Job {} depends on unknown key `{dep}`",
                    job.id
                );
                return DepState::Blocked;
            };
            match (self.config.dependency_policy, latest.status) {
                (_, JobStatus::Completed) => {}
                (DependencyPolicy::CompletedRegardless, s) if s.is_terminal() => {}
                (DependencyPolicy::Success, s) if s.is_terminal() => {
                    // No further attempt is coming for this key.
                    if latest.retry_count >= latest.max_retries {
                        return DepState::Blocked;
                    }
                    waiting = true;
                }
                _ => waiting = true,
            }
        }
        if waiting {
            DepState::Waiting
        } else {
            DepState::Ready
        }
    }

    fn finalize_run(&self, state: &mut State, run: RunId) -> Result<(), Error> {
        let jobs: Vec<&QueuedJob> = state.jobs.values().filter(|j| j.run == run).collect();
        if jobs.is_empty() || jobs.iter().any(|j| !j.status.is_terminal()) {
            return Ok(());
        }
        // Only the newest attempt per key decides the conclusion.
        let mut latest: HashMap<&str, &QueuedJob> = HashMap::new();
        for &job in &jobs {
            let entry = latest.entry(job.key.as_str()).or_insert(job);
            if job.retry_count > entry.retry_count {
                *entry = job;
            }
        }
        let conclusion = if latest.values().any(|j| j.status == JobStatus::Failed) {
            RunConclusion::Failure
        } else if latest.values().any(|j| j.status == JobStatus::Cancelled) {
            RunConclusion::Cancelled
        } else {
            RunConclusion::Success
        };
        let status = if conclusion == RunConclusion::Cancelled {
            RunStatus::Cancelled
        } else {
            RunStatus::Completed
        };
        self.store.set_run_status(run, status, Some(conclusion))?;
        log::debug!(target: "dispatch", "Run {run} concluded: {}", conclusion.as_str());
        Ok(())
    }

    /// Wake one candidate runner for newly ready work, per the configured
    /// assignment policy.
    fn nudge(&self, state: &mut State, requirements: &crate::job::Requirements) {
        let ids = state.registry.candidates(requirements);
        let candidates: Vec<&Runner> = ids
            .iter()
            .filter_map(|id| state.registry.get(*id))
            .collect();
        let Some(picked) = self.config.policy.select(&mut state.policy, &candidates) else {
            return;
        };
        if let Some(tx) = state.subscriptions.get(&picked) {
            tx.try_send(()).ok();
            log::trace!(target: "dispatch", "Nudged runner {picked}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{Priority, Requirements};
    use plue::identity::UserId;
    use plue::repo::RepoId;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeSet;

    fn caps(labels: &[&str], max_parallel: u32) -> Capabilities {
        Capabilities {
            labels: labels.iter().map(|s| s.to_string()).collect(),
            architecture: "amd64".to_owned(),
            memory_mb: 8192,
            cpus: 8,
            docker: true,
            max_parallel,
        }
    }

    struct Fixture {
        dispatcher: Dispatcher,
        run: RunId,
    }

    fn fixture(config: DispatchConfig) -> Fixture {
        let store = Store::memory().unwrap();
        let workflow = store
            .upsert_workflow(RepoId(1), "ci.yaml", &[], &Default::default())
            .unwrap();
        let run = store
            .create_run(
                workflow,
                RepoId(1),
                &serde_json::json!({"kind": "push"}),
                "abc",
                "refs/heads/main",
                UserId(1),
                0,
            )
            .unwrap();
        Fixture {
            dispatcher: Dispatcher::new(store, config),
            run: run.id,
        }
    }

    fn job(run: RunId, key: &str, priority: Priority, deps: &[&str]) -> QueuedJob {
        QueuedJob {
            id: JobId(0),
            run,
            key: key.to_owned(),
            priority,
            requirements: Requirements::default(),
            deps: deps.iter().map(|s| s.to_string()).collect(),
            retry_count: 0,
            max_retries: 0,
            timeout_secs: 3600,
            enqueued_at: 0,
            status: JobStatus::Pending,
            reason: None,
        }
    }

    /// Scenario: J1{normal}, J2{high}, J3{critical} enqueued in that order
    /// come back as J3, J2, J1.
    #[test]
    fn test_priority_order() {
        let f = fixture(DispatchConfig::default());
        let ids = f
            .dispatcher
            .enqueue(
                vec![
                    job(f.run, "j1", Priority::Normal, &[]),
                    job(f.run, "j2", Priority::High, &[]),
                    job(f.run, "j3", Priority::Critical, &[]),
                ],
                0,
            )
            .unwrap();

        let runner = RunnerId(1);
        let polled: Vec<String> = (0..3)
            .map(|i| {
                f.dispatcher
                    .poll(runner, "r1", caps(&[], 10), i)
                    .unwrap()
                    .expect("a job should be assigned")
                    .key
            })
            .collect();
        assert_eq!(polled, ["j3", "j2", "j1"]);
        assert_eq!(ids.len(), 3);
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 10), 3).unwrap(), None);
    }

    /// Scenario: JB{needs JA} is held until JA completes successfully.
    #[test]
    fn test_dependency_gating() {
        let f = fixture(DispatchConfig::default());
        f.dispatcher
            .enqueue(
                vec![
                    job(f.run, "ja", Priority::Normal, &[]),
                    job(f.run, "jb", Priority::Normal, &["ja"]),
                ],
                0,
            )
            .unwrap();

        let runner = RunnerId(1);
        let first = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        assert_eq!(first.key, "ja");
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 10), 1).unwrap(), None);

        f.dispatcher
            .update_status(first.id, JobOutcome::Completed, 2)
            .unwrap();
        let second = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 3)
            .unwrap()
            .unwrap();
        assert_eq!(second.key, "jb");
    }

    #[test]
    fn test_capacity_respected() {
        let f = fixture(DispatchConfig::default());
        f.dispatcher
            .enqueue(
                vec![
                    job(f.run, "a", Priority::Normal, &[]),
                    job(f.run, "b", Priority::Normal, &[]),
                ],
                0,
            )
            .unwrap();

        let runner = RunnerId(1);
        let first = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 1), 0)
            .unwrap()
            .unwrap();
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 1), 1).unwrap(), None);
        f.dispatcher
            .update_status(first.id, JobOutcome::Completed, 2)
            .unwrap();
        assert!(f.dispatcher.poll(runner, "r1", caps(&[], 1), 3).unwrap().is_some());
    }

    /// A job assigned to one runner is never observable by another.
    #[test]
    fn test_exclusive_assignment() {
        let f = fixture(DispatchConfig::default());
        f.dispatcher
            .enqueue(vec![job(f.run, "only", Priority::Normal, &[])], 0)
            .unwrap();

        let job1 = f
            .dispatcher
            .poll(RunnerId(1), "r1", caps(&[], 10), 0)
            .unwrap();
        assert!(job1.is_some());
        assert_eq!(
            f.dispatcher.poll(RunnerId(2), "r2", caps(&[], 10), 0).unwrap(),
            None
        );
    }

    #[test]
    fn test_label_matching_in_poll() {
        let f = fixture(DispatchConfig::default());
        let mut labelled = job(f.run, "gpu-job", Priority::Normal, &[]);
        labelled.requirements.labels = BTreeSet::from(["gpu".to_owned()]);
        f.dispatcher.enqueue(vec![labelled], 0).unwrap();

        // A runner with no labels matches only zero-label jobs.
        assert_eq!(
            f.dispatcher.poll(RunnerId(1), "plain", caps(&[], 10), 0).unwrap(),
            None
        );
        assert!(f
            .dispatcher
            .poll(RunnerId(2), "gpu", caps(&["gpu"], 10), 0)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_explicit_failure_retries_until_limit() {
        let f = fixture(DispatchConfig::default());
        let mut flaky = job(f.run, "flaky", Priority::Normal, &[]);
        flaky.max_retries = 1;
        f.dispatcher.enqueue(vec![flaky], 0).unwrap();

        let runner = RunnerId(1);
        let first = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        f.dispatcher
            .update_status(
                first.id,
                JobOutcome::Failed {
                    reason: "exit 1".to_owned(),
                },
                1,
            )
            .unwrap();

        // A retry with an incremented counter is queued as a new job.
        let second = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 2)
            .unwrap()
            .unwrap();
        assert_ne!(second.id, first.id);
        assert_eq!(second.key, "flaky");
        assert_eq!(second.retry_count, 1);

        f.dispatcher
            .update_status(
                second.id,
                JobOutcome::Failed {
                    reason: "exit 1".to_owned(),
                },
                3,
            )
            .unwrap();
        // Retry limit reached; nothing further.
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 10), 4).unwrap(), None);
    }

    #[test]
    fn test_runner_lost_fails_and_retries() {
        let config = DispatchConfig {
            heartbeat_interval: 10,
            missed_heartbeats: 3,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        let mut j = job(f.run, "long", Priority::Normal, &[]);
        j.max_retries = 1;
        f.dispatcher.enqueue(vec![j], 0).unwrap();

        let lost = RunnerId(1);
        let assigned = f
            .dispatcher
            .poll(lost, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();

        // Thirty-one seconds of silence: three missed heartbeats.
        f.dispatcher.tick(31).unwrap();
        let (stored, _) = f.dispatcher.store().job(assigned.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Failed);
        assert_eq!(stored.reason.as_deref(), Some(REASON_RUNNER_LOST));

        // The retry goes to a living runner.
        let retry = f
            .dispatcher
            .poll(RunnerId(2), "r2", caps(&[], 10), 32)
            .unwrap()
            .unwrap();
        assert_eq!(retry.key, "long");
        assert_eq!(retry.retry_count, 1);
    }

    #[test]
    fn test_cancel_queued_and_in_progress() {
        let f = fixture(DispatchConfig::default());
        let ids = f
            .dispatcher
            .enqueue(
                vec![
                    job(f.run, "a", Priority::Normal, &[]),
                    job(f.run, "b", Priority::Normal, &[]),
                ],
                0,
            )
            .unwrap();

        // Queued job: cancelled immediately.
        f.dispatcher.cancel(ids[1], 0).unwrap();
        let (stored, _) = f.dispatcher.store().job(ids[1]).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        // In-progress job: abort requested, delivered via heartbeat, then
        // acknowledged.
        let runner = RunnerId(1);
        let running = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        f.dispatcher.cancel(running.id, 1).unwrap();
        let aborts = f.dispatcher.heartbeat(runner, 2).unwrap();
        assert_eq!(aborts, vec![running.id]);

        f.dispatcher
            .update_status(running.id, JobOutcome::Cancelled, 3)
            .unwrap();
        let (stored, _) = f.dispatcher.store().job(running.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);

        // Cancelling a terminal job is refused.
        assert!(matches!(
            f.dispatcher.cancel(running.id, 4),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_unacknowledged_abort_is_forced() {
        let config = DispatchConfig {
            abort_timeout: 5,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        f.dispatcher
            .enqueue(vec![job(f.run, "stuck", Priority::Normal, &[])], 0)
            .unwrap();
        let running = f
            .dispatcher
            .poll(RunnerId(1), "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        f.dispatcher.cancel(running.id, 1).unwrap();

        f.dispatcher.tick(7).unwrap();
        let (stored, _) = f.dispatcher.store().job(running.id).unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(stored.reason.as_deref(), Some(REASON_ABORT_TIMEOUT));
    }

    #[test]
    fn test_dependency_failure_blocks_dependents_by_default() {
        let f = fixture(DispatchConfig::default());
        f.dispatcher
            .enqueue(
                vec![
                    job(f.run, "ja", Priority::Normal, &[]),
                    job(f.run, "jb", Priority::Normal, &["ja"]),
                ],
                0,
            )
            .unwrap();

        let runner = RunnerId(1);
        let first = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        f.dispatcher
            .update_status(
                first.id,
                JobOutcome::Failed {
                    reason: "exit 1".to_owned(),
                },
                1,
            )
            .unwrap();

        // jb can never run; it is failed with a dependency reason.
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 10), 2).unwrap(), None);
        let run_jobs = f.dispatcher.store().jobs_for_run(f.run).unwrap();
        let jb = run_jobs.iter().find(|j| j.key == "jb").unwrap();
        assert_eq!(jb.status, JobStatus::Failed);
        assert_eq!(jb.reason.as_deref(), Some(REASON_DEPENDENCY_FAILED));

        let run = f.dispatcher.store().run(f.run).unwrap().unwrap();
        assert_eq!(run.conclusion, Some(RunConclusion::Failure));
    }

    #[test]
    fn test_completed_regardless_policy_unblocks_dependents() {
        let config = DispatchConfig {
            dependency_policy: DependencyPolicy::CompletedRegardless,
            ..DispatchConfig::default()
        };
        let f = fixture(config);
        f.dispatcher
            .enqueue(
                vec![
                    job(f.run, "ja", Priority::Normal, &[]),
                    job(f.run, "jb", Priority::Normal, &["ja"]),
                ],
                0,
            )
            .unwrap();

        let runner = RunnerId(1);
        let first = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 0)
            .unwrap()
            .unwrap();
        f.dispatcher
            .update_status(
                first.id,
                JobOutcome::Failed {
                    reason: "exit 1".to_owned(),
                },
                1,
            )
            .unwrap();

        let second = f
            .dispatcher
            .poll(runner, "r1", caps(&[], 10), 2)
            .unwrap()
            .unwrap();
        assert_eq!(second.key, "jb");
    }

    #[test]
    fn test_recovery_resets_orphaned_assignments() {
        let store = Store::memory().unwrap();
        let workflow = store
            .upsert_workflow(RepoId(1), "ci.yaml", &[], &Default::default())
            .unwrap();
        let run = store
            .create_run(
                workflow,
                RepoId(1),
                &serde_json::json!({}),
                "abc",
                "refs/heads/main",
                UserId(1),
                0,
            )
            .unwrap();

        // First life: a job is assigned and the process dies.
        {
            let dispatcher = Dispatcher::new(store, DispatchConfig::default());
            dispatcher
                .enqueue(vec![job(run.id, "build", Priority::Normal, &[])], 0)
                .unwrap();
            dispatcher
                .poll(RunnerId(1), "r1", caps(&[], 10), 0)
                .unwrap()
                .unwrap();

            // Second life on the same database: the runner is gone, the job
            // must come back as queued.
            let Dispatcher { store, .. } = dispatcher;
            let recovered = Dispatcher::new(store, DispatchConfig::default());
            assert_eq!(recovered.recover(100).unwrap(), 1);
            let revived = recovered
                .poll(RunnerId(2), "r2", caps(&[], 10), 101)
                .unwrap()
                .unwrap();
            assert_eq!(revived.key, "build");
        }
    }

    #[test]
    fn test_metrics_snapshot() {
        let f = fixture(DispatchConfig::default());
        f.dispatcher
            .enqueue(
                vec![
                    job(f.run, "a", Priority::Critical, &[]),
                    job(f.run, "b", Priority::Low, &[]),
                ],
                0,
            )
            .unwrap();
        let runner = RunnerId(1);
        f.dispatcher.poll(runner, "r1", caps(&[], 2), 5).unwrap().unwrap();

        let metrics = f.dispatcher.metrics(10);
        assert_eq!(metrics.queue_depths, [0, 0, 0, 1]);
        assert_eq!(metrics.oldest_job_age, Some(10));
        assert_eq!(metrics.average_wait, Some(5.0));
        assert_eq!(metrics.utilization.get(&runner), Some(&0.5));
    }

    #[test]
    fn test_nudge_on_ready_work() {
        let f = fixture(DispatchConfig::default());
        let runner = RunnerId(1);
        // Register by polling once, then subscribe.
        assert_eq!(f.dispatcher.poll(runner, "r1", caps(&[], 2), 0).unwrap(), None);
        let nudges = f.dispatcher.subscribe(runner);

        f.dispatcher
            .enqueue(vec![job(f.run, "a", Priority::Normal, &[])], 1)
            .unwrap();
        assert!(nudges.try_recv().is_ok(), "runner should be nudged");
    }
}
