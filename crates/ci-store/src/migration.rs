//! Schema migration system.
//!
//! Migrations are stored as static SQL strings keyed by version number.
//! The current version is tracked in a `_migrations` table so migrations
//! are idempotent and only run once.

use rusqlite::Connection;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};

/// A single migration definition.
struct Migration {
    /// Monotonically increasing version number (1, 2, 3, ...).
    version: u32,
    /// Human-readable description.
    description: &'static str,
    /// Raw SQL to execute. May contain multiple statements separated by `;`.
    sql: &'static str,
}

/// All migrations in order. Add new migrations to the end of this array.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "initial schema — users, repositories, builds, jobs, worker ledger",
        sql: r#"
            CREATE TABLE users (
                id         TEXT PRIMARY KEY,
                username   TEXT NOT NULL UNIQUE,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE repositories (
                id              INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id        TEXT NOT NULL REFERENCES users(id),
                full_name       TEXT NOT NULL UNIQUE,
                default_branch  TEXT NOT NULL DEFAULT 'main',
                provider_name   TEXT NOT NULL,
                provider_url    TEXT NOT NULL,
                provider_token  TEXT NOT NULL,
                created_at      INTEGER NOT NULL
            );
            CREATE INDEX idx_repositories_owner ON repositories(owner_id);

            CREATE TABLE builds (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                repo_id          INTEGER NOT NULL REFERENCES repositories(id),
                branch           TEXT NOT NULL,
                commit_sha       TEXT NOT NULL,
                commit_message   TEXT NOT NULL DEFAULT '',
                author_name      TEXT NOT NULL DEFAULT '',
                author_email     TEXT NOT NULL DEFAULT '',
                committer_name   TEXT NOT NULL DEFAULT '',
                committer_email  TEXT NOT NULL DEFAULT '',
                config           TEXT NOT NULL DEFAULT '',
                start_time       INTEGER,
                end_time         INTEGER,
                created_at       INTEGER NOT NULL
            );
            CREATE INDEX idx_builds_repo ON builds(repo_id);
            CREATE INDEX idx_builds_repo_created ON builds(repo_id, created_at DESC);

            CREATE TABLE jobs (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                build_id     INTEGER NOT NULL REFERENCES builds(id) ON DELETE CASCADE,
                commands     TEXT NOT NULL,
                image        TEXT NOT NULL,
                env          TEXT NOT NULL DEFAULT '[]',
                priority     INTEGER NOT NULL DEFAULT 1000,
                status       TEXT NOT NULL DEFAULT 'unknown'
                             CHECK(status IN ('unknown','queued','running','passing','failing','cancelled')),
                worker_id    TEXT,
                start_time   INTEGER,
                end_time     INTEGER,
                created_at   INTEGER NOT NULL
            );
            CREATE INDEX idx_jobs_build ON jobs(build_id);
            CREATE INDEX idx_jobs_status ON jobs(status);

            CREATE TABLE worker_ledger (
                worker_id  TEXT PRIMARY KEY,
                address    TEXT NOT NULL,
                max_slots  INTEGER NOT NULL,
                last_seen  INTEGER NOT NULL
            );
        "#,
    },
];

// ── public API ───────────────────────────────────────────────────────

/// Run all pending migrations against `conn`.
///
/// This is a **synchronous** function — call it from `spawn_blocking`.
pub fn run_all(conn: &Connection) -> StoreResult<()> {
    ensure_migrations_table(conn)?;

    let current = current_version(conn)?;
    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        debug!(current_version = current, "database schema is up to date");
        return Ok(());
    }

    info!(
        current_version = current,
        pending = pending.len(),
        "running pending migrations"
    );

    for migration in pending {
        apply(conn, migration)?;
    }

    info!(
        new_version = MIGRATIONS.last().map(|m| m.version).unwrap_or(0),
        "all migrations applied"
    );
    Ok(())
}

/// Return the latest applied migration version, or 0 if none.
pub fn current_version(conn: &Connection) -> StoreResult<u32> {
    let version: u32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM _migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::Migration {
            version: 0,
            message: format!("failed to read current version: {e}"),
        })?;
    Ok(version)
}

// ── internals ────────────────────────────────────────────────────────

/// Create the `_migrations` bookkeeping table if it does not exist.
fn ensure_migrations_table(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version     INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at  INTEGER NOT NULL
        );",
    )
    .map_err(|e| StoreError::Migration {
        version: 0,
        message: format!("failed to create _migrations table: {e}"),
    })?;
    Ok(())
}

/// Apply a single migration inside a transaction.
fn apply(conn: &Connection, migration: &Migration) -> StoreResult<()> {
    info!(
        version = migration.version,
        description = migration.description,
        "applying migration"
    );

    // We cannot use `conn.transaction()` because that requires `&mut Connection`,
    // so we manage the transaction manually with SAVEPOINT.
    conn.execute_batch("BEGIN IMMEDIATE;")
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to begin transaction: {e}"),
        })?;

    let result = (|| -> StoreResult<()> {
        conn.execute_batch(migration.sql)
            .map_err(|e| StoreError::Migration {
                version: migration.version,
                message: format!("SQL execution failed: {e}"),
            })?;

        let now = chrono::Utc::now().timestamp();
        conn.execute(
            "INSERT INTO _migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![migration.version, migration.description, now],
        )
        .map_err(|e| StoreError::Migration {
            version: migration.version,
            message: format!("failed to record migration: {e}"),
        })?;

        Ok(())
    })();

    match &result {
        Ok(()) => {
            conn.execute_batch("COMMIT;")
                .map_err(|e| StoreError::Migration {
                    version: migration.version,
                    message: format!("failed to commit: {e}"),
                })?;
            info!(
                version = migration.version,
                "migration applied successfully"
            );
        }
        Err(err) => {
            warn!(version = migration.version, %err, "migration failed, rolling back");
            let _ = conn.execute_batch("ROLLBACK;");
        }
    }

    result
}

// ── tests ────────────────────────────────────────────────────────────
