//! Build orchestrator: turns SCM triggers into builds and jobs.
//!
//! Where [`crate::scheduler`] is concerned only with matching queued jobs to
//! workers, the orchestrator sits above it: it resolves a repository's CI
//! config at a commit, expands it into a job matrix, persists the build, and
//! feeds the jobs to the scheduler. It depends only on narrow traits so that
//! `ci-store` and `ci-adapters` can supply concrete persistence and SCM
//! integrations without this crate depending on either of them.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::broadcast::BroadcastSink;
use crate::domain::{Build, BuildId, CommitAuthor, Job, JobStatus, RepoId, Repository, UserId};
use crate::error::{CiError, Result};
use crate::scheduler::Scheduler;

/// Persistence seam for repositories. Implemented concretely by `ci-store`.
#[async_trait]
pub trait RepoRepository: Send + Sync {
    /// Resolve a repository owned by `user_id`. Fails with [`CiError::NotFound`]
    /// both when the repository does not exist and when it exists but is
    /// owned by someone else -- the caller cannot distinguish the two, which
    /// is the point.
    async fn find(&self, repo_id: RepoId, user_id: UserId) -> Result<Repository>;
}

/// Persistence seam for builds. Implemented concretely by `ci-store`.
#[async_trait]
pub trait BuildRepository: Send + Sync {
    async fn insert(&self, build: &Build) -> Result<BuildId>;
    async fn get(&self, build_id: BuildId) -> Result<Build>;
    async fn update_times(&self, build: &Build) -> Result<()>;
    async fn list_for_repo(&self, repo_id: RepoId, limit: u32) -> Result<Vec<Build>>;
}

/// Persistence seam for jobs. Implemented concretely by `ci-store`.
#[async_trait]
pub trait JobRepository: Send + Sync {
    async fn insert_all(&self, build_id: BuildId, jobs: &[Job]) -> Result<Vec<Job>>;
    async fn update_status(&self, job: &Job) -> Result<()>;
    async fn list_for_build(&self, build_id: BuildId) -> Result<Vec<Job>>;
}

/// Resolves a CI config document at a given commit. Implemented concretely
/// by `ci-adapters`'s config parser.
pub trait ConfigExpander: Send + Sync {
    /// Parse a raw config document into the job matrix it describes.
    fn expand(&self, config: &str, commit_sha: &str) -> Result<Vec<JobSpec>>;
}

/// One entry of a parsed CI config, prior to being assigned a [`crate::domain::JobId`].
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub commands: Vec<String>,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub priority: i64,
}

/// Fetches a repository's CI config at a commit. Implemented concretely by
/// `ci-adapters`'s SCM integrations (e.g. GitHub).
#[async_trait]
pub trait ScmAdapter: Send + Sync {
    async fn fetch_config(&self, repo: &Repository, commit_sha: &str) -> Result<String>;
}

/// Everything needed to trigger a build from an SCM push/webhook payload.
#[derive(Debug, Clone)]
pub struct TriggerRequest {
    pub repo_id: RepoId,
    /// The user on whose behalf this trigger is issued. Checked against the
    /// repository's owner before anything else happens.
    pub user_id: UserId,
    pub branch: String,
    pub commit_sha: String,
    pub commit_message: String,
    pub author: CommitAuthor,
    pub committer: CommitAuthor,
}

/// Default job priority assigned to every job in a newly triggered build.
/// Restarted jobs and manually re-run jobs keep this same value -- the
/// scheduler treats "freshest build" and "oldest build" identically by
/// priority, letting ties fall back to submission order.
const DEFAULT_JOB_PRIORITY: i64 = 1000;

/// Orchestrates the full trigger -> config resolution -> scheduling path,
/// and keeps each build's aggregate `start_time`/`end_time` in sync as its
/// jobs report status.
pub struct BuildOrchestrator {
    repos: Arc<dyn RepoRepository>,
    builds: Arc<dyn BuildRepository>,
    jobs: Arc<dyn JobRepository>,
    scm: Arc<dyn ScmAdapter>,
    config: Arc<dyn ConfigExpander>,
    scheduler: Scheduler,
    events: BroadcastSink,
    /// One lock per build actively being aggregated, so concurrent job
    /// status reports for the same build serialize their
    /// read-modify-write of `start_time`/`end_time` without serializing
    /// unrelated builds.
    aggregation_locks: tokio::sync::Mutex<HashMap<BuildId, Arc<AsyncMutex<()>>>>,
}

impl BuildOrchestrator {
    pub fn new(
        repos: Arc<dyn RepoRepository>,
        builds: Arc<dyn BuildRepository>,
        jobs: Arc<dyn JobRepository>,
        scm: Arc<dyn ScmAdapter>,
        config: Arc<dyn ConfigExpander>,
        scheduler: Scheduler,
        events: BroadcastSink,
    ) -> Self {
        Self {
            repos,
            builds,
            jobs,
            scm,
            config,
            scheduler,
            events,
            aggregation_locks: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Spawn the background task that keeps build aggregates in sync with
    /// job status changes. Returns a join handle; the task runs until the
    /// scheduler's job-event channel closes.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = Arc::clone(self);
        let mut job_events = this.scheduler.subscribe_job_events();
        tokio::spawn(async move {
            while let Ok(job_id) = job_events.recv().await {
                let Some(job) = this.scheduler.job(job_id) else {
                    continue;
                };
                if let Err(err) = this.jobs.update_status(&job).await {
                    warn!(job_id, error = %err, "failed to persist job status");
                }
                this.events
                    .broadcast_job_status(job_id, job.build_id, status_label(job.status));
                if let Err(err) = this.update_build_time(job.build_id).await {
                    warn!(build_id = job.build_id, error = %err, "failed to update build aggregate");
                }
            }
        })
    }

    /// Resolve the repository's CI config at `req.commit_sha`, expand it
    /// into a job matrix, persist the build and its jobs, and schedule
    /// every job.
    pub async fn trigger_build(&self, req: TriggerRequest) -> Result<Build> {
        let repo = self.repos.find(req.repo_id, req.user_id).await?;
        let config = self.scm.fetch_config(&repo, &req.commit_sha).await?;
        let specs = self.config.expand(&config, &req.commit_sha)?;
        if specs.is_empty() {
            warn!(repo_id = req.repo_id, "config expanded to zero jobs");
        }

        let build = Build {
            id: 0,
            repo_id: req.repo_id,
            branch: req.branch,
            commit_sha: req.commit_sha.clone(),
            commit_message: req.commit_message,
            author: req.author,
            committer: req.committer,
            config,
            start_time: None,
            end_time: None,
            jobs: Vec::new(),
        };
        let build_id = self.builds.insert(&build).await?;

        let placeholder_jobs: Vec<Job> = specs
            .into_iter()
            .map(|spec| Job {
                id: 0,
                build_id,
                commands: spec.commands,
                image: spec.image,
                env: spec.env,
                repo_url: repo.provider_url.clone(),
                provider_name: repo.provider_name.clone(),
                provider_url: repo.provider_url.clone(),
                provider_token: repo.provider_token.clone(),
                commit_sha: req.commit_sha.clone(),
                repo_full_name: repo.full_name.clone(),
                priority: spec.priority,
                status: JobStatus::Unknown,
                start_time: None,
                end_time: None,
                worker_id: None,
                sequence: 0,
            })
            .collect();

        let mut persisted_jobs = self.jobs.insert_all(build_id, &placeholder_jobs).await?;
        for job in &persisted_jobs {
            self.scheduler.schedule(job.clone());
        }
        // `schedule` only mutates the scheduler's own copy to `Queued`; mirror
        // that onto the jobs we're about to hand back so a `GET` right after
        // trigger doesn't still report them as `unknown`.
        for job in &mut persisted_jobs {
            job.status = JobStatus::Queued;
        }

        info!(build_id, job_count = persisted_jobs.len(), "build triggered");
        self.events.broadcast_new_build(build_id);

        let mut build = self.builds.get(build_id).await?;
        build.jobs = persisted_jobs;
        Ok(build)
    }

    /// Cancel every non-terminal job of a build concurrently. A job that
    /// fails to cancel (e.g. its worker never acknowledges) is logged and
    /// skipped rather than aborting the rest -- siblings still get cancelled.
    pub async fn stop_build(&self, build_id: BuildId) -> Result<()> {
        let jobs = self.jobs.list_for_build(build_id).await?;
        let mut tasks = tokio::task::JoinSet::new();
        for job in jobs.into_iter().filter(|j| !j.status.is_terminal()) {
            let scheduler = self.scheduler.clone();
            tasks.spawn(async move { (job.id, scheduler.cancel(job.id).await) });
        }
        while let Some(result) = tasks.join_next().await {
            match result {
                Ok((_, Ok(()))) => {}
                Ok((job_id, Err(err))) => {
                    warn!(job_id, error = %err, "failed to cancel job during stop");
                }
                Err(join_err) => warn!(error = %join_err, "cancel task panicked during stop"),
            }
        }
        self.events.broadcast_build_stopped(build_id);
        Ok(())
    }

    /// Stop the build, clear its aggregate times so it reopens, and
    /// re-schedule every job from scratch. Clearing both `start_time` and
    /// `end_time` is the only way a build un-absorbs its terminal state.
    pub async fn restart_build(&self, build_id: BuildId) -> Result<()> {
        self.stop_build(build_id).await?;

        let mut build = self.builds.get(build_id).await?;
        build.start_time = None;
        build.end_time = None;
        self.builds.update_times(&build).await?;

        let jobs = self.jobs.list_for_build(build_id).await?;
        for mut job in jobs {
            job.status = JobStatus::Unknown;
            job.start_time = None;
            job.end_time = None;
            job.worker_id = None;
            self.scheduler.schedule(job);
        }
        self.events.broadcast_build_restarted(build_id);
        Ok(())
    }

    /// Re-schedule a single job by id, independent of its build's other jobs.
    pub async fn restart_job(&self, build_id: BuildId, job_id: crate::domain::JobId) -> Result<()> {
        let jobs = self.jobs.list_for_build(build_id).await?;
        let mut job = jobs
            .into_iter()
            .find(|j| j.id == job_id)
            .ok_or(CiError::NotFound {
                entity: "job",
                id: job_id.to_string(),
            })?;
        if job.status == JobStatus::Running {
            return Err(CiError::InvalidJobState {
                job_id,
                reason: "job is already running".into(),
            });
        }
        // Drop any existing queue entry first -- otherwise two back-to-back
        // restarts of a still-queued job would leave it enqueued twice.
        self.scheduler.cancel(job_id).await?;
        job.status = JobStatus::Unknown;
        job.start_time = None;
        job.end_time = None;
        job.worker_id = None;
        self.scheduler.schedule(job);
        Ok(())
    }

    pub async fn get_build(&self, build_id: BuildId) -> Result<Build> {
        let mut build = self.builds.get(build_id).await?;
        build.jobs = self.jobs.list_for_build(build_id).await?;
        Ok(build)
    }

    pub async fn list_builds(&self, repo_id: RepoId, limit: u32) -> Result<Vec<Build>> {
        self.builds.list_for_repo(repo_id, limit).await
    }

    /// Clone of the lifecycle-event sink, for callers (e.g. `ci-web`'s
    /// websocket layer) that need to subscribe independently of the
    /// orchestrator's own background consumer.
    pub fn events(&self) -> BroadcastSink {
        self.events.clone()
    }

    /// Recompute and persist `build_id`'s aggregate start/end times from its
    /// current jobs, serialized per-build so concurrent job completions
    /// cannot race each other's read-modify-write.
    async fn update_build_time(&self, build_id: BuildId) -> Result<()> {
        let lock = {
            let mut locks = self.aggregation_locks.lock().await;
            Arc::clone(
                locks
                    .entry(build_id)
                    .or_insert_with(|| Arc::new(AsyncMutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        let mut build = self.builds.get(build_id).await?;
        build.jobs = self.jobs.list_for_build(build_id).await?;
        if build.recompute_times() {
            self.builds.update_times(&build).await?;
        }

        // Evict the lock once the build has no further reason to change --
        // every job has reached a terminal state.
        if build.jobs.iter().all(|j| j.status.is_terminal()) {
            self.aggregation_locks.lock().await.remove(&build_id);
        }
        Ok(())
    }
}

fn status_label(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Unknown => "unknown",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Passing => "passing",
        JobStatus::Failing => "failing",
        JobStatus::Cancelled => "cancelled",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::InMemoryCoordinationClient;
    use crate::registry::WorkerRegistry;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeRepos(Repository);
    #[async_trait]
    impl RepoRepository for FakeRepos {
        async fn find(&self, _repo_id: RepoId, user_id: UserId) -> Result<Repository> {
            if user_id != self.0.owner_id {
                return Err(CiError::NotFound {
                    entity: "repository",
                    id: _repo_id.to_string(),
                });
            }
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeBuilds {
        next_id: AtomicU64,
        store: DashMap<BuildId, Build>,
    }
    #[async_trait]
    impl BuildRepository for FakeBuilds {
        async fn insert(&self, build: &Build) -> Result<BuildId> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
            let mut build = build.clone();
            build.id = id;
            self.store.insert(id, build);
            Ok(id)
        }
        async fn get(&self, build_id: BuildId) -> Result<Build> {
            self.store
                .get(&build_id)
                .map(|b| b.clone())
                .ok_or(CiError::BuildNotFound { build_id })
        }
        async fn update_times(&self, build: &Build) -> Result<()> {
            if let Some(mut existing) = self.store.get_mut(&build.id) {
                existing.start_time = build.start_time;
                existing.end_time = build.end_time;
            }
            Ok(())
        }
        async fn list_for_repo(&self, repo_id: RepoId, _limit: u32) -> Result<Vec<Build>> {
            Ok(self
                .store
                .iter()
                .filter(|b| b.repo_id == repo_id)
                .map(|b| b.clone())
                .collect())
        }
    }

    #[derive(Default)]
    struct FakeJobs {
        next_id: AtomicU64,
        store: DashMap<crate::domain::JobId, Job>,
    }
    #[async_trait]
    impl JobRepository for FakeJobs {
        async fn insert_all(&self, build_id: BuildId, jobs: &[Job]) -> Result<Vec<Job>> {
            let mut out = Vec::with_capacity(jobs.len());
            for job in jobs {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                let mut job = job.clone();
                job.id = id;
                job.build_id = build_id;
                self.store.insert(id, job.clone());
                out.push(job);
            }
            Ok(out)
        }
        async fn update_status(&self, job: &Job) -> Result<()> {
            self.store.insert(job.id, job.clone());
            Ok(())
        }
        async fn list_for_build(&self, build_id: BuildId) -> Result<Vec<Job>> {
            Ok(self
                .store
                .iter()
                .filter(|j| j.build_id == build_id)
                .map(|j| j.clone())
                .collect())
        }
    }

    struct FakeScm(String);
    #[async_trait]
    impl ScmAdapter for FakeScm {
        async fn fetch_config(&self, _repo: &Repository, _commit_sha: &str) -> Result<String> {
            Ok(self.0.clone())
        }
    }

    struct FixedExpander(Vec<JobSpec>);
    impl ConfigExpander for FixedExpander {
        fn expand(&self, _config: &str, _commit_sha: &str) -> Result<Vec<JobSpec>> {
            Ok(self.0.clone())
        }
    }

    fn repo() -> Repository {
        Repository {
            id: 1,
            owner_id: uuid::Uuid::nil(),
            full_name: "acme/widgets".into(),
            default_branch: "main".into(),
            provider_name: "github".into(),
            provider_url: "https://api.github.com".into(),
            provider_token: "tok".into(),
        }
    }

    fn harness(specs: Vec<JobSpec>) -> Arc<BuildOrchestrator> {
        let registry = WorkerRegistry::new();
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry, coordination);
        Arc::new(BuildOrchestrator::new(
            Arc::new(FakeRepos(repo())),
            Arc::new(FakeBuilds::default()),
            Arc::new(FakeJobs::default()),
            Arc::new(FakeScm("jobs: []".into())),
            Arc::new(FixedExpander(specs)),
            scheduler,
            BroadcastSink::new(16),
        ))
    }

    fn spec() -> JobSpec {
        JobSpec {
            commands: vec!["cargo test".into()],
            image: "rust:1".into(),
            env: vec![],
            priority: DEFAULT_JOB_PRIORITY,
        }
    }

    #[tokio::test]
    async fn trigger_build_persists_and_schedules_every_job() {
        let orchestrator = harness(vec![spec(), spec()]);
        let build = orchestrator.trigger_build(trigger_request()).await.unwrap();

        assert_eq!(build.jobs.len(), 2);
        assert!(build.jobs.iter().all(|j| j.status == JobStatus::Queued));
    }

    #[tokio::test]
    async fn trigger_build_by_non_owner_is_not_found() {
        let orchestrator = harness(vec![spec()]);
        let err = orchestrator
            .trigger_build(TriggerRequest {
                repo_id: 1,
                user_id: uuid::Uuid::from_u128(1),
                branch: "main".into(),
                commit_sha: "deadbeef".into(),
                commit_message: "msg".into(),
                author: CommitAuthor { name: "a".into(), email: "a@x.com".into() },
                committer: CommitAuthor { name: "a".into(), email: "a@x.com".into() },
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CiError::NotFound { entity: "repository", .. }));
    }

    #[tokio::test]
    async fn build_end_time_waits_for_every_job() {
        let orchestrator = harness(vec![spec(), spec()]);
        let build = orchestrator.trigger_build(trigger_request()).await.unwrap();

        let first = build.jobs[0].id;
        orchestrator
            .jobs
            .update_status(&Job {
                status: JobStatus::Passing,
                start_time: Some(chrono::Utc::now()),
                end_time: Some(chrono::Utc::now()),
                ..build.jobs[0].clone()
            })
            .await
            .unwrap();
        orchestrator.update_build_time(build.id).await.unwrap();

        let refreshed = orchestrator.get_build(build.id).await.unwrap();
        assert_eq!(refreshed.end_time, None, "second job is still unterminated");
        let _ = first;
    }

    fn trigger_request() -> TriggerRequest {
        TriggerRequest {
            repo_id: 1,
            user_id: uuid::Uuid::nil(),
            branch: "main".into(),
            commit_sha: "deadbeef".into(),
            commit_message: "msg".into(),
            author: CommitAuthor { name: "a".into(), email: "a@x.com".into() },
            committer: CommitAuthor { name: "a".into(), email: "a@x.com".into() },
        }
    }

    fn make_worker_ready(registry: &WorkerRegistry, id: &str, max: u32) {
        registry.apply(&crate::coordination::WatchEvent::Put {
            key: format!("workers/{id}"),
            value: format!(r#"{{"address":"a","max":{max}}}"#),
            revision: 0,
        });
        registry.apply(&crate::coordination::WatchEvent::Put {
            key: format!("workers/{id}/status"),
            value: r#"{"running":0}"#.into(),
            revision: 1,
        });
    }

    /// Three jobs of the same build, all still queued (no worker has ever
    /// claimed them): `stop_build` fans cancellation out across all three
    /// concurrently and every one ends up cancelled, not just the first.
    #[tokio::test]
    async fn stop_build_cancels_every_job_concurrently() {
        let orchestrator = harness(vec![spec(), spec(), spec()]);
        let build = orchestrator.trigger_build(trigger_request()).await.unwrap();

        orchestrator.stop_build(build.id).await.unwrap();

        for job in &build.jobs {
            assert_eq!(orchestrator.scheduler.job(job.id).unwrap().status, JobStatus::Cancelled);
        }
    }

    /// `restart_job` twice in a row on a still-queued job must not leave it
    /// enqueued twice -- observed here as the worker's running count staying
    /// at 1 rather than climbing to 2 once the dispatch loop processes both
    /// would-be queue entries.
    #[tokio::test]
    async fn restart_job_twice_leaves_it_queued_once() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 1);
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry.clone(), coordination);
        let orchestrator = Arc::new(BuildOrchestrator::new(
            Arc::new(FakeRepos(repo())),
            Arc::new(FakeBuilds::default()),
            Arc::new(FakeJobs::default()),
            Arc::new(FakeScm("jobs: []".into())),
            Arc::new(FixedExpander(vec![spec()])),
            scheduler.clone(),
            BroadcastSink::new(16),
        ));

        // Trigger with no dispatch loop running yet, so the job stays
        // `Queued` through both restarts below instead of being picked up.
        let build = orchestrator.trigger_build(trigger_request()).await.unwrap();
        let job_id = build.jobs[0].id;

        orchestrator.restart_job(build.id, job_id).await.unwrap();
        orchestrator.restart_job(build.id, job_id).await.unwrap();

        let handle = scheduler.start();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;

        assert_eq!(
            registry.capacity().1,
            1,
            "double-queuing the job would double the worker's running count"
        );

        scheduler.shutdown();
        handle.await.unwrap();
    }

    /// `restart_build` cancels every running job, clears the build's
    /// aggregate times, and resubmits every job so it can be re-aggregated
    /// from scratch.
    #[tokio::test]
    async fn restart_build_clears_times_and_resubmits_every_job() {
        let orchestrator = harness(vec![spec()]);
        let build = orchestrator.trigger_build(trigger_request()).await.unwrap();

        orchestrator
            .jobs
            .update_status(&Job {
                status: JobStatus::Passing,
                start_time: Some(chrono::Utc::now()),
                end_time: Some(chrono::Utc::now()),
                ..build.jobs[0].clone()
            })
            .await
            .unwrap();
        orchestrator.update_build_time(build.id).await.unwrap();
        let completed = orchestrator.get_build(build.id).await.unwrap();
        assert!(completed.end_time.is_some(), "build looks complete before restart");

        orchestrator.restart_build(build.id).await.unwrap();

        let restarted = orchestrator.get_build(build.id).await.unwrap();
        assert_eq!(restarted.start_time, None);
        assert_eq!(restarted.end_time, None);
    }
}
