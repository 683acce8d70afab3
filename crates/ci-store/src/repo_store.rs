//! Repository persistence.
//!
//! CRUD over the `repositories` table, and the concrete
//! [`ci_kernel::orchestrator::RepoRepository`] the orchestrator trusts for
//! trigger-time lookups.

use async_trait::async_trait;
use ci_kernel::{CiError, RepoId, Repository, UserId};
use tracing::{debug, instrument};

use crate::db::Database;
use crate::error::{StoreError, StoreResult};

/// CRUD operations on registered repositories.
#[derive(Clone)]
pub struct RepoStore {
    db: Database,
}

impl RepoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn create(&self, repo: &Repository) -> StoreResult<RepoId> {
        let repo = repo.clone();
        let now = chrono::Utc::now().timestamp();
        self.db
            .execute(move |conn| {
                conn.execute(
                    "INSERT INTO repositories \
                     (owner_id, full_name, default_branch, provider_name, provider_url, provider_token, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        repo.owner_id.to_string(),
                        repo.full_name,
                        repo.default_branch,
                        repo.provider_name,
                        repo.provider_url,
                        repo.provider_token,
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid() as RepoId)
            })
            .await
    }

    /// Resolve a repository by id, scoped to `owner_id`. Returns
    /// [`StoreError::NotFound`] both when no repository has that id and when
    /// it exists but belongs to a different owner.
    #[instrument(skip(self))]
    pub async fn find(&self, id: RepoId, owner_id: UserId) -> StoreResult<Repository> {
        self.db
            .execute(move |conn| {
                conn.query_row(
                    "SELECT id, owner_id, full_name, default_branch, provider_name, provider_url, provider_token \
                     FROM repositories WHERE id = ?1 AND owner_id = ?2",
                    rusqlite::params![id, owner_id.to_string()],
                    row_to_repo,
                )
                .map_err(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound {
                        entity: "repository",
                        id: id.to_string(),
                    },
                    other => StoreError::Sqlite(other),
                })
            })
            .await
    }

    #[instrument(skip(self))]
    pub async fn list_for_owner(&self, owner_id: UserId) -> StoreResult<Vec<Repository>> {
        self.db
            .execute(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, owner_id, full_name, default_branch, provider_name, provider_url, provider_token \
                     FROM repositories WHERE owner_id = ?1 ORDER BY id",
                )?;
                let rows = stmt
                    .query_map(rusqlite::params![owner_id.to_string()], row_to_repo)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

fn row_to_repo(row: &rusqlite::Row) -> rusqlite::Result<Repository> {
    let owner_id: String = row.get(1)?;
    Ok(Repository {
        id: row.get(0)?,
        owner_id: owner_id.parse().unwrap_or_else(|_| uuid::Uuid::nil()),
        full_name: row.get(2)?,
        default_branch: row.get(3)?,
        provider_name: row.get(4)?,
        provider_url: row.get(5)?,
        provider_token: row.get(6)?,
    })
}

#[async_trait]
impl ci_kernel::RepoRepository for RepoStore {
    async fn find(&self, repo_id: RepoId, user_id: UserId) -> ci_kernel::Result<Repository> {
        RepoStore::find(self, repo_id, user_id)
            .await
            .map_err(CiError::from)
    }
}
