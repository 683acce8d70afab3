//! Abstruse CI kernel.
//!
//! This crate provides the foundational control-plane services for the CI
//! scheduler:
//!
//! - **[`domain`]** -- Shared types for workers, jobs, and builds.
//! - **[`coordination`]** -- Keyed read/watch/lease abstraction over a
//!   distributed coordination store, with an in-memory reference
//!   implementation.
//! - **[`registry`]** -- Concurrent worker registry using [`dashmap::DashMap`],
//!   reconciled from coordination-store watch events.
//! - **[`queue`]** -- Priority job queue with FIFO tie-break.
//! - **[`scheduler`]** -- The dispatch loop matching queued jobs to workers
//!   with capacity, plus cancellation and worker-loss reconciliation.
//! - **[`orchestrator`]** -- Turns SCM triggers into builds and jobs, and
//!   keeps each build's aggregate timing in sync with its jobs.
//! - **[`broadcast`]** -- Best-effort pub/sub fan-out of build/job lifecycle
//!   events to the web layer.
//! - **[`error`]** -- Unified error type via [`thiserror`].
//!
//! All public types are `Send + Sync` and designed for use within a
//! multi-threaded tokio runtime. Concrete persistence (`ci-store`) and SCM/
//! config integrations (`ci-adapters`) depend on this crate, not the other
//! way around -- the traits in [`orchestrator`] are the seam.

pub mod broadcast;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod orchestrator;
pub mod queue;
pub mod registry;
pub mod scheduler;

pub use broadcast::{BroadcastSink, BuildEvent};
pub use coordination::{CoordinationClient, InMemoryCoordinationClient, LeaseId, WatchEvent};
pub use domain::{
    Build, BuildId, CommitAuthor, EnvBinding, Job, JobId, JobStatus, RepoId, Repository, UserId,
    Worker, WorkerId, WorkerStatus,
};
pub use error::{CiError, Result};
pub use orchestrator::{
    BuildOrchestrator, BuildRepository, ConfigExpander, JobRepository, JobSpec, RepoRepository,
    ScmAdapter, TriggerRequest,
};
pub use queue::JobQueue;
pub use registry::{run_worker_watch, WorkerRegistry};
pub use scheduler::{DispatchRecord, JobStatusRecord, Scheduler};
