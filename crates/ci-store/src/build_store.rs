//! Build persistence.
//!
//! CRUD over the `builds` table, and the concrete
//! [`ci_kernel::orchestrator::BuildRepository`] the orchestrator uses to
//! create builds and keep their aggregate timing in sync.

use async_trait::async_trait;
use ci_kernel::{Build, BuildId, CiError, CommitAuthor, RepoId};
use chrono::{DateTime, Utc};
use tracing::instrument;

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// CRUD operations on builds. Jobs are not loaded here -- callers that need
/// a build's jobs fetch them separately from [`crate::job_store::JobStore`]
/// and attach them, matching how [`ci_kernel::domain::Build::jobs`] is
/// populated lazily by the orchestrator.
#[derive(Clone)]
pub struct BuildStore {
    db: Database,
}

impl BuildStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self, build))]
    pub async fn insert(&self, build: &Build) -> StoreResult<BuildId> {
        let build = build.clone();
        let now = Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO builds \
                     (repo_id, branch, commit_sha, commit_message, author_name, author_email, \
                      committer_name, committer_email, config, start_time, end_time, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        build.repo_id,
                        build.branch,
                        build.commit_sha,
                        build.commit_message,
                        build.author.name,
                        build.author.email,
                        build.committer.name,
                        build.committer.email,
                        build.config,
                        build.start_time.map(|t| t.timestamp()),
                        build.end_time.map(|t| t.timestamp()),
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid() as BuildId)
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn get(&self, id: BuildId) -> StoreResult<Build> {
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT id, repo_id, branch, commit_sha, commit_message, \
                            author_name, author_email, committer_name, committer_email, \
                            config, start_time, end_time \
                     FROM builds WHERE id = ?1",
                    rusqlite::params![id],
                    row_to_build,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "build",
                        id: id.to_string(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await
    }

    #[instrument(skip(self, build))]
    pub async fn update_times(&self, build: &Build) -> StoreResult<()> {
        let id = build.id;
        let start = build.start_time.map(|t| t.timestamp());
        let end = build.end_time.map(|t| t.timestamp());
        self.db
            .execute(move |conn| {
                conn.execute(
                    "UPDATE builds SET start_time = ?1, end_time = ?2 WHERE id = ?3",
                    rusqlite::params![start, end, id],
                )?;
                Ok(())
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_for_repo(&self, repo_id: RepoId, limit: u32) -> StoreResult<Vec<Build>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, repo_id, branch, commit_sha, commit_message, \
                            author_name, author_email, committer_name, committer_email, \
                            config, start_time, end_time \
                     FROM builds WHERE repo_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![repo_id, limit], row_to_build)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_build(row: &rusqlite::Row) -> rusqlite::Result<Build> {
    let start_time: Option<i64> = row.get(10)?;
    let end_time: Option<i64> = row.get(11)?;
    Ok(Build {
        id: row.get(0)?,
        repo_id: row.get(1)?,
        branch: row.get(2)?,
        commit_sha: row.get(3)?,
        commit_message: row.get(4)?,
        author: CommitAuthor {
            name: row.get(5)?,
            email: row.get(6)?,
        },
        committer: CommitAuthor {
            name: row.get(7)?,
            email: row.get(8)?,
        },
        config: row.get(9)?,
        start_time: start_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        end_time: end_time.and_then(|t| DateTime::from_timestamp(t, 0)),
        jobs: Vec::new(),
    })
}

#[async_trait]
impl ci_kernel::BuildRepository for BuildStore {
    async fn insert(&self, build: &Build) -> ci_kernel::Result<BuildId> {
        BuildStore::insert(self, build).await.map_err(CiError::from)
    }

    async fn get(&self, build_id: BuildId) -> ci_kernel::Result<Build> {
        BuildStore::get(self, build_id).await.map_err(CiError::from)
    }

    async fn update_times(&self, build: &Build) -> ci_kernel::Result<()> {
        BuildStore::update_times(self, build).await.map_err(CiError::from)
    }

    async fn list_for_repo(&self, repo_id: RepoId, limit: u32) -> ci_kernel::Result<Vec<Build>> {
        BuildStore::list_for_repo(self, repo_id, limit)
            .await
            .map_err(CiError::from)
    }
}
