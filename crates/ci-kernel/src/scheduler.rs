//! Scheduler core: matches pending jobs to workers with capacity.
//!
//! A single dedicated task, woken by a [`tokio::sync::Notify`], drains work
//! against authoritative per-job state kept in a [`DashMap`]. Dispatch
//! publishes a [`DispatchRecord`] to the coordination store rather than
//! running anything directly, since running the job itself is a worker
//! responsibility, not the scheduler's.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::coordination::CoordinationClient;
use crate::domain::{Job, JobId, JobStatus};
use crate::error::{CiError, Result};
use crate::queue::JobQueue;
use crate::registry::WorkerRegistry;

/// Wire shape of a `jobs/<workerID>/<jobID>` dispatch record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRecord {
    pub id: JobId,
    #[serde(rename = "buildID")]
    pub build_id: u64,
    pub commands: Vec<String>,
    pub image: String,
    pub env: Vec<(String, String)>,
    pub url: String,
    #[serde(rename = "providerName")]
    pub provider_name: String,
    #[serde(rename = "providerURL")]
    pub provider_url: String,
    #[serde(rename = "providerToken")]
    pub provider_token: String,
    #[serde(rename = "commitSHA")]
    pub commit_sha: String,
    #[serde(rename = "repoName")]
    pub repo_name: String,
    pub priority: i64,
}

impl From<&Job> for DispatchRecord {
    fn from(job: &Job) -> Self {
        Self {
            id: job.id,
            build_id: job.build_id,
            commands: job.commands.clone(),
            image: job.image.clone(),
            env: job.env.clone(),
            url: job.repo_url.clone(),
            provider_name: job.provider_name.clone(),
            provider_url: job.provider_url.clone(),
            provider_token: job.provider_token.clone(),
            commit_sha: job.commit_sha.clone(),
            repo_name: job.repo_full_name.clone(),
            priority: job.priority,
        }
    }
}

/// Wire shape of a `jobs/<workerID>/<jobID>/status` worker-written record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusRecord {
    pub status: String,
    pub start_time: Option<chrono::DateTime<Utc>>,
    pub end_time: Option<chrono::DateTime<Utc>>,
    #[serde(default)]
    pub log_ref: Option<String>,
}

fn parse_status(s: &str) -> Option<JobStatus> {
    match s {
        "running" => Some(JobStatus::Running),
        "passing" => Some(JobStatus::Passing),
        "failing" => Some(JobStatus::Failing),
        "cancelled" => Some(JobStatus::Cancelled),
        _ => None,
    }
}

const CANCEL_TIMEOUT: Duration = Duration::from_secs(10);

struct SchedulerInner {
    queue: Mutex<JobQueue>,
    jobs: DashMap<JobId, Job>,
    registry: WorkerRegistry,
    coordination: Arc<dyn CoordinationClient>,
    notify: Notify,
    shutdown: AtomicBool,
    cancel_acks: DashMap<JobId, oneshot::Sender<()>>,
    job_events: broadcast::Sender<JobId>,
}

/// Priority-aware job scheduler, cheaply cloneable (`Arc`-backed).
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(registry: WorkerRegistry, coordination: Arc<dyn CoordinationClient>) -> Self {
        let (job_events, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(SchedulerInner {
                queue: Mutex::new(JobQueue::new()),
                jobs: DashMap::new(),
                registry,
                coordination,
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                cancel_acks: DashMap::new(),
                job_events,
            }),
        }
    }

    /// Subscribe to job ids whose status just changed. The build
    /// orchestrator uses this to trigger `update_build_time`.
    pub fn subscribe_job_events(&self) -> broadcast::Receiver<JobId> {
        self.inner.job_events.subscribe()
    }

    /// Spawn the background dispatch loop and the worker-loss reconciler.
    /// Returns a handle that resolves once `shutdown` is called and the
    /// loop drains.
    pub fn start(&self) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        let mut lost_rx = inner.registry.subscribe_lost();
        let reconcile_self = self.clone();
        tokio::spawn(async move {
            while let Ok(worker_id) = lost_rx.recv().await {
                reconcile_self.requeue_jobs_for_worker(&worker_id);
            }
        });

        tokio::spawn(async move {
            info!("scheduler loop started");
            Self::worker_loop(&inner).await;
            info!("scheduler loop stopped");
        })
    }

    /// Enqueue a job and wake the scheduling loop. Non-blocking, never
    /// fails.
    pub fn schedule(&self, mut job: Job) {
        {
            let mut queue = self.inner.queue.lock().expect("queue mutex poisoned");
            job.sequence = queue.next_sequence();
            job.status = JobStatus::Queued;
            self.inner.jobs.insert(job.id, job.clone());
            queue.enqueue(job);
        }
        self.inner.notify.notify_one();
    }

    /// Re-enqueue a job preserving its original priority and sequence (so
    /// it keeps its historical position in the queue). Used on the
    /// worker-loss wake path.
    fn requeue(&self, mut job: Job) {
        job.status = JobStatus::Queued;
        job.worker_id = None;
        self.inner.jobs.insert(job.id, job.clone());
        self.inner
            .queue
            .lock()
            .expect("queue mutex poisoned")
            .enqueue(job);
        self.inner.notify.notify_one();
    }

    fn requeue_jobs_for_worker(&self, worker_id: &str) {
        let running: Vec<Job> = self
            .inner
            .jobs
            .iter()
            .filter(|e| {
                e.value().status == JobStatus::Running
                    && e.value().worker_id.as_deref() == Some(worker_id)
            })
            .map(|e| e.value().clone())
            .collect();

        for job in running {
            warn!(job_id = job.id, worker_id, "worker lost, re-enqueueing job");
            self.requeue(job);
        }
    }

    /// Cancel a job: pre-dispatch, a synchronous success; dispatched, a
    /// bounded wait for worker acknowledgement; terminal, a no-op success.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let current = self
            .inner
            .jobs
            .get(&job_id)
            .map(|j| j.clone())
            .ok_or(CiError::JobNotFound { job_id })?;

        match current.status {
            JobStatus::Queued => {
                self.inner.queue.lock().expect("queue mutex poisoned").remove(job_id);
                self.mark_terminal(job_id, JobStatus::Cancelled, None, None);
                Ok(())
            }
            s if s.is_terminal() => Ok(()),
            JobStatus::Running => self.cancel_dispatched(job_id).await,
            JobStatus::Unknown => Ok(()),
        }
    }

    async fn cancel_dispatched(&self, job_id: JobId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.inner.cancel_acks.insert(job_id, tx);

        let key = format!("control/{job_id}");
        self.inner
            .coordination
            .put(&key, r#"{"action":"cancel"}"#, None)
            .await
            .map_err(|e| CiError::CoordinationUnavailable {
                reason: e.to_string(),
            })?;

        match tokio::time::timeout(CANCEL_TIMEOUT, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => {
                self.inner.cancel_acks.remove(&job_id);
                warn!(job_id, "cancel not acknowledged in time, forcing terminal");
                self.mark_terminal(job_id, JobStatus::Cancelled, None, None);
                Err(CiError::Timeout { job_id })
            }
        }
    }

    fn mark_terminal(
        &self,
        job_id: JobId,
        status: JobStatus,
        start_time: Option<chrono::DateTime<Utc>>,
        end_time: Option<chrono::DateTime<Utc>>,
    ) {
        if let Some(mut job) = self.inner.jobs.get_mut(&job_id) {
            job.status = status;
            if start_time.is_some() {
                job.start_time = start_time;
            }
            job.end_time = end_time.or(Some(Utc::now()));
        }
        let _ = self.inner.job_events.send(job_id);
    }

    /// Consume a worker-written status record. Late reports against an
    /// already-terminal job are ignored, preserving the absorbing-terminal-
    /// state invariant.
    pub fn notify(&self, job_id: JobId, record: JobStatusRecord) {
        let Some(new_status) = parse_status(&record.status) else {
            warn!(job_id, status = %record.status, "ignoring unrecognised job status");
            return;
        };

        let mut should_ack = false;
        {
            let Some(mut job) = self.inner.jobs.get_mut(&job_id) else {
                warn!(job_id, "status report for unknown job, ignoring");
                return;
            };

            if job.status.is_terminal() {
                debug!(job_id, "ignoring late status report for terminal job");
                return;
            }

            job.status = new_status;
            if job.start_time.is_none() {
                job.start_time = record.start_time.or(job.start_time);
            }
            if new_status.is_terminal() {
                job.end_time = record.end_time.or(Some(Utc::now()));
                should_ack = true;
            }
        }

        if should_ack
            && let Some((_, tx)) = self.inner.cancel_acks.remove(&job_id)
        {
            let _ = tx.send(());
        }

        let _ = self.inner.job_events.send(job_id);
        // A terminal status frees worker capacity; wake the dispatch loop so
        // it can immediately consider the next queued job.
        self.inner.notify.notify_one();
    }

    pub fn job(&self, job_id: JobId) -> Option<Job> {
        self.inner.jobs.get(&job_id).map(|j| j.clone())
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.notify.notify_one();
    }

    async fn worker_loop(inner: &SchedulerInner) {
        loop {
            loop {
                let Some(worker) = inner.registry.most_slack() else {
                    break;
                };
                let job = {
                    let mut queue = inner.queue.lock().expect("queue mutex poisoned");
                    queue.dequeue()
                };
                let Some(mut job) = job else {
                    break;
                };

                job.status = JobStatus::Running;
                job.worker_id = Some(worker.id.clone());
                job.start_time = Some(Utc::now());
                inner.jobs.insert(job.id, job.clone());
                inner.registry.increment_running(&worker.id);

                let key = format!("jobs/{}/{}", worker.id, job.id);
                let record = DispatchRecord::from(&job);
                let payload = serde_json::to_string(&record).expect("dispatch record serializes");

                match inner.coordination.put(&key, &payload, None).await {
                    Ok(()) => {
                        info!(job_id = job.id, worker_id = %worker.id, "job dispatched");
                        let _ = inner.job_events.send(job.id);
                    }
                    Err(err) => {
                        warn!(job_id = job.id, worker_id = %worker.id, error = %err, "dispatch failed, marking worker lost");
                        inner.registry.mark_lost(&worker.id);
                        job.status = JobStatus::Queued;
                        job.worker_id = None;
                        job.start_time = None;
                        inner.jobs.insert(job.id, job.clone());
                        inner.queue.lock().expect("queue mutex poisoned").enqueue(job);
                    }
                }
            }

            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
            inner.notify.notified().await;
            if inner.shutdown.load(Ordering::Acquire) {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::{InMemoryCoordinationClient, WatchEvent};

    fn job(id: JobId, priority: i64) -> Job {
        Job {
            id,
            build_id: 1,
            commands: vec!["echo hi".into()],
            image: "alpine".into(),
            env: vec![],
            repo_url: String::new(),
            provider_name: String::new(),
            provider_url: String::new(),
            provider_token: String::new(),
            commit_sha: String::new(),
            repo_full_name: String::new(),
            priority,
            status: JobStatus::Unknown,
            start_time: None,
            end_time: None,
            worker_id: None,
            sequence: 0,
        }
    }

    fn make_worker_ready(registry: &WorkerRegistry, id: &str, max: u32) {
        registry.apply(&WatchEvent::Put {
            key: format!("workers/{id}"),
            value: format!(r#"{{"address":"a","max":{max}}}"#),
            revision: 0,
        });
        registry.apply(&WatchEvent::Put {
            key: format!("workers/{id}/status"),
            value: r#"{"running":0}"#.into(),
            revision: 1,
        });
    }

    #[tokio::test]
    async fn happy_path_dispatches_within_capacity() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 2);
        make_worker_ready(&registry, "b", 1);

        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry.clone(), coordination.clone());
        let handle = scheduler.start();

        for i in 1..=3 {
            scheduler.schedule(job(i, 1000));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        let dispatched: Vec<_> = (1..=3)
            .map(|i| scheduler.job(i).unwrap())
            .filter(|j| j.status == JobStatus::Running)
            .collect();
        assert_eq!(dispatched.len(), 3);

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn capacity_wait_dispatches_in_submission_order() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 1);

        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry.clone(), coordination.clone());
        let handle = scheduler.start();

        scheduler.schedule(job(1, 1000));
        scheduler.schedule(job(2, 1000));
        scheduler.schedule(job(3, 1000));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Running);
        assert_eq!(scheduler.job(2).unwrap().status, JobStatus::Queued);
        assert_eq!(scheduler.job(3).unwrap().status, JobStatus::Queued);

        scheduler.notify(
            1,
            JobStatusRecord {
                status: "passing".into(),
                start_time: None,
                end_time: Some(Utc::now()),
                log_ref: None,
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(scheduler.job(2).unwrap().status, JobStatus::Running);
        assert_eq!(scheduler.job(3).unwrap().status, JobStatus::Queued);

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn priority_preempts_queued_job() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 1);
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry.clone(), coordination.clone());

        // Worker A already holds job X (simulate by dispatching it first).
        scheduler.schedule(job(100, 1));
        let handle = scheduler.start();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.job(100).unwrap().status, JobStatus::Running);

        scheduler.schedule(job(1, 500)); // Y
        scheduler.schedule(job(2, 2000)); // Z

        scheduler.notify(
            100,
            JobStatusRecord {
                status: "passing".into(),
                start_time: None,
                end_time: Some(Utc::now()),
                log_ref: None,
            },
        );
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(scheduler.job(2).unwrap().status, JobStatus::Running); // Z first
        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Queued);

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn worker_loss_requeues_running_job() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 1);
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry.clone(), coordination.clone());
        let handle = scheduler.start();

        scheduler.schedule(job(1, 1000));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Running);

        registry.apply(&crate::coordination::WatchEvent::Delete {
            key: "workers/a".into(),
            revision: 2,
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let j = scheduler.job(1).unwrap();
        assert_eq!(j.status, JobStatus::Queued);
        assert!(j.worker_id.is_none());

        scheduler.shutdown();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn cancel_queued_job_is_removed_and_terminal() {
        let registry = WorkerRegistry::new();
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry, coordination);

        scheduler.schedule(job(1, 1000));
        scheduler.cancel(1).await.unwrap();

        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn late_report_after_force_cancel_is_ignored() {
        let registry = WorkerRegistry::new();
        make_worker_ready(&registry, "a", 1);
        let coordination = InMemoryCoordinationClient::new();
        let scheduler = Scheduler::new(registry, coordination);
        let handle = scheduler.start();

        scheduler.schedule(job(1, 1000));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Running);

        // Force the job terminal without going through the ack path, then
        // simulate a late status report racing in afterward.
        scheduler.mark_terminal(1, JobStatus::Cancelled, None, None);
        scheduler.notify(
            1,
            JobStatusRecord {
                status: "running".into(),
                start_time: None,
                end_time: None,
                log_ref: None,
            },
        );

        assert_eq!(scheduler.job(1).unwrap().status, JobStatus::Cancelled);

        scheduler.shutdown();
        handle.await.unwrap();
    }
}
