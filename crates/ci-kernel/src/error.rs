//! Unified error type for the CI control plane.
//!
//! All core subsystems surface errors through [`CiError`], which is the
//! single error type returned by every public API in this crate. Each
//! variant carries enough context for callers to decide how to handle the
//! failure without inspecting opaque strings.

use crate::domain::{BuildId, JobId, WorkerId};

/// Unified error type for the scheduler and worker-fleet coordinator.
#[derive(Debug, thiserror::Error)]
pub enum CiError {
    // -- Registry / coordination errors --------------------------------------
    /// The referenced worker is not present in the registry.
    #[error("worker not found: {worker_id}")]
    WorkerNotFound { worker_id: WorkerId },

    /// Dispatch to the worker failed; the worker should be marked lost.
    #[error("worker unreachable: {worker_id}")]
    WorkerUnreachable { worker_id: WorkerId },

    /// The coordination store's watch channel could not be re-established.
    #[error("coordination store unavailable: {reason}")]
    CoordinationUnavailable { reason: String },

    // -- Queue / scheduler errors ---------------------------------------------
    /// The referenced job does not exist.
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// A cancel request was not acknowledged within the bounded timeout.
    #[error("cancel of job {job_id} timed out waiting for worker acknowledgement")]
    Timeout { job_id: JobId },

    /// The job cannot transition to the requested state from its current one.
    #[error("invalid job state transition for {job_id}: {reason}")]
    InvalidJobState { job_id: JobId, reason: String },

    // -- Orchestrator errors ----------------------------------------------------
    /// Generic not-found for repositories/builds looked up by the orchestrator.
    #[error("not found: {entity} {id}")]
    NotFound { entity: &'static str, id: String },

    /// The referenced build does not exist.
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: BuildId },

    /// The SCM adapter could not reach the provider.
    #[error("scm provider unavailable: {reason}")]
    ScmUnavailable { reason: String },

    /// The repository config file is absent at the given commit.
    #[error("repository config missing at commit {commit_sha}")]
    ConfigMissing { commit_sha: String },

    /// The repository config file failed to parse.
    #[error("repository config invalid at {line}:{column}: {reason}")]
    ConfigInvalid {
        line: usize,
        column: usize,
        reason: String,
    },

    /// A repository implementation failed. Half-written state is tolerated;
    /// this variant only reports the failure upward.
    #[error("persistence error: {0}")]
    Persistence(String),

    // -- Fatal ------------------------------------------------------------------
    /// Unrecoverable failure that should terminate the process (registry
    /// watch lost forever, coordination client cannot reconnect, ...).
    #[error("fatal error: {0}")]
    Fatal(String),
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, CiError>;
