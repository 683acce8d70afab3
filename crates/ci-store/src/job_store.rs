//! Job persistence.
//!
//! CRUD over the `jobs` table, and the concrete
//! [`ci_kernel::orchestrator::JobRepository`] the orchestrator and the
//! job-status watcher use to persist dispatch and status changes.

use async_trait::async_trait;
use ci_kernel::{BuildId, CiError, EnvBinding, Job, JobId, JobStatus};
use chrono::DateTime;
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// CRUD operations on jobs belonging to a build.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert every job of a freshly triggered build in one transaction,
    /// returning them with their assigned ids.
    #[instrument(skip(self, jobs))]
    pub async fn insert_all(&self, build_id: BuildId, jobs: &[Job]) -> StoreResult<Vec<Job>> {
        let jobs = jobs.to_vec();
        self.db
            .execute_mut(move |conn| {
                let tx = conn.transaction()?;
                let mut out = Vec::with_capacity(jobs.len());
                for job in jobs {
                    let env = serde_json::to_string(&job.env)?;
                    let commands = serde_json::to_string(&job.commands)?;
                    tx.execute(
                        "INSERT INTO jobs (build_id, commands, image, env, priority, status, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                        rusqlite::params![
                            build_id,
                            commands,
                            job.image,
                            env,
                            job.priority,
                            status_str(job.status),
                            chrono::Utc::now().timestamp(),
                        ],
                    )?;
                    let id = tx.last_insert_rowid() as JobId;
                    out.push(Job {
                        id,
                        build_id,
                        status: JobStatus::Queued,
                        ..job
                    });
                }
                tx.commit()?;
                Ok(out)
            })
            .await
    }

    #[instrument(skip(self, job))]
    pub async fn update_status(&self, job: &Job) -> StoreResult<()> {
        let job = job.clone();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE jobs SET status = ?1, worker_id = ?2, start_time = ?3, end_time = ?4 \
                     WHERE id = ?5",
                    rusqlite::params![
                        status_str(job.status),
                        job.worker_id,
                        job.start_time.map(|t| t.timestamp()),
                        job.end_time.map(|t| t.timestamp()),
                        job.id,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_for_build(&self, build_id: BuildId) -> StoreResult<Vec<Job>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT j.id, j.build_id, j.commands, j.image, j.env, j.priority, j.status, \
                            j.worker_id, j.start_time, j.end_time, \
                            b.commit_sha, b.config, \
                            r.provider_name, r.provider_url, r.provider_token, r.full_name \
                     FROM jobs j \
                     JOIN builds b ON b.id = j.build_id \
                     JOIN repositories r ON r.id = b.repo_id \
                     WHERE j.build_id = ?1 ORDER BY j.id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![build_id], row_to_job)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn status_str(status: JobStatus) -> &'static str {
    match status {
        JobStatus::Unknown => "unknown",
        JobStatus::Queued => "queued",
        JobStatus::Running => "running",
        JobStatus::Passing => "passing",
        JobStatus::Failing => "failing",
        JobStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> JobStatus {
    match s {
        "queued" => JobStatus::Queued,
        "running" => JobStatus::Running,
        "passing" => JobStatus::Passing,
        "failing" => JobStatus::Failing,
        "cancelled" => JobStatus::Cancelled,
        _ => JobStatus::Unknown,
    }
}

fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
    let commands: String = row.get(2)?;
    let env: String = row.get(4)?;
    let status: String = row.get(6)?;
    let start_time: Option<i64> = row.get(8)?;
    let end_time: Option<i64> = row.get(9)?;
    let commit_sha: String = row.get(10)?;

    Ok(Job {
        id: row.get(0)?,
        build_id: row.get(1)?,
        commands: serde_json::from_str(&commands).unwrap_or_default(),
        image: row.get(3)?,
        env: serde_json::from_str::<Vec<EnvBinding>>(&env).unwrap_or_default(),
        priority: row.get(5)?,
        status: parse_status(&status),
        worker_id: row.get(7)?,
        start_time: start_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        end_time: end_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        commit_sha,
        repo_url: row.get(13)?,
        provider_name: row.get(12)?,
        provider_url: row.get(13)?,
        provider_token: row.get(14)?,
        repo_full_name: row.get(15)?,
        sequence: 0,
    })
}

#[async_trait]
impl ci_kernel::JobRepository for JobStore {
    async fn insert_all(&self, build_id: BuildId, jobs: &[Job]) -> ci_kernel::Result<Vec<Job>> {
        JobStore::insert_all(self, build_id, jobs)
            .await
            .map_err(CiError::from)
    }

    async fn update_status(&self, job: &Job) -> ci_kernel::Result<()> {
        JobStore::update_status(self, job).await.map_err(CiError::from)
    }

    async fn list_for_build(&self, build_id: BuildId) -> ci_kernel::Result<Vec<Job>> {
        JobStore::list_for_build(self, build_id)
            .await
            .map_err(CiError::from)
    }
}
