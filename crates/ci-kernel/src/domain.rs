//! Core domain types shared by every subsystem: workers, jobs, builds.
//!
//! These types are intentionally persistence-agnostic -- `ci-store` maps
//! them onto SQLite rows and `ci-adapters` fills them in from SCM/config
//! data, but neither crate defines the shapes themselves.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, opaque identifier for a worker, assigned by the worker itself.
pub type WorkerId = String;

/// Monotonically assigned job identifier.
pub type JobId = u64;

/// Identifier for a build.
pub type BuildId = u64;

/// Identifier for a repository record.
pub type RepoId = u64;

/// Identifier for a user/account (owner of a repository trigger).
pub type UserId = Uuid;

/// Liveness/admission state of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkerStatus {
    /// Announcement key observed, status key not yet seen.
    Joining,
    /// Eligible to receive dispatches.
    Ready,
    /// Still tracked but not accepting new work (not produced by the core
    /// today -- reserved for an operator-initiated drain).
    Draining,
    /// Key deleted or lease expired; the worker is gone.
    Lost,
}

/// A worker node known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub address: String,
    pub max: u32,
    pub running: u32,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
}

impl Worker {
    /// Free capacity slack: `max - running`.
    pub fn slack(&self) -> i64 {
        i64::from(self.max) - i64::from(self.running)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Unknown,
    Queued,
    Running,
    Passing,
    Failing,
    Cancelled,
}

impl JobStatus {
    /// Terminal statuses are absorbing except for an explicit restart.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Passing | Self::Failing | Self::Cancelled)
    }
}

/// A single environment binding (`KEY=value`) passed to a job's container.
pub type EnvBinding = (String, String);

/// A unit of execution scheduled onto exactly one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub build_id: BuildId,
    pub commands: Vec<String>,
    pub image: String,
    pub env: Vec<EnvBinding>,
    pub repo_url: String,
    pub provider_name: String,
    pub provider_url: String,
    pub provider_token: String,
    pub commit_sha: String,
    pub repo_full_name: String,
    pub priority: i64,
    pub status: JobStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub worker_id: Option<WorkerId>,
    /// Monotonic enqueue sequence, used only for the queue's FIFO tie-break.
    pub sequence: u64,
}

/// A commit's author or committer identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// A single invocation triggered by one commit; contains one or more jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: BuildId,
    pub repo_id: RepoId,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub author: CommitAuthor,
    pub committer: CommitAuthor,
    pub config: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub jobs: Vec<Job>,
}

impl Build {
    /// Recompute `start_time`/`end_time` from child jobs: start is the
    /// earliest child start, end is the latest child end but only once
    /// every job has ended. Returns `true` if anything changed.
    pub fn recompute_times(&mut self) -> bool {
        let mut changed = false;

        if let Some(min_start) = self.jobs.iter().filter_map(|j| j.start_time).min()
            && self.start_time != Some(min_start)
        {
            self.start_time = Some(min_start);
            changed = true;
        }

        let all_ended = !self.jobs.is_empty() && self.jobs.iter().all(|j| j.end_time.is_some());
        if all_ended {
            let max_end = self.jobs.iter().filter_map(|j| j.end_time).max();
            if self.end_time != max_end {
                self.end_time = max_end;
                changed = true;
            }
        } else if self.end_time.is_some() {
            self.end_time = None;
            changed = true;
        }

        changed
    }
}

/// A registered repository, owned by a user, tracked by one SCM provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repository {
    pub id: RepoId,
    pub owner_id: UserId,
    pub full_name: String,
    pub default_branch: String,
    pub provider_name: String,
    pub provider_url: String,
    pub provider_token: String,
}
