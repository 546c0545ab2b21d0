//! Actions job dispatching for the Plue Git service.
//!
//! Queued jobs are matched to capability-tagged runners through a priority
//! queue with dependency tracking, retry semantics and restart recovery.
//! Runners pull work with [`dispatch::Dispatcher::poll`]; the post-receive
//! trigger in [`trigger`] is the producer, turning push events into
//! workflow runs.
pub mod dispatch;
pub mod job;
pub mod policy;
pub mod queue;
pub mod runner;
pub mod store;
pub mod trigger;

pub use dispatch::{DispatchConfig, Dispatcher, JobOutcome};
pub use job::{JobId, JobStatus, Priority, QueuedJob, Requirements};
pub use runner::{Capabilities, Runner, RunnerId, RunnerStatus};
pub use store::{RunId, Store, WorkflowId};
