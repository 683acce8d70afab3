//! # ci-store
//!
//! SQLite-backed persistence for the CI control plane.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │  RepoStore / BuildStore / JobStore       │
//! │  (ci_kernel::{RepoRepository,            │
//! │   BuildRepository, JobRepository} impls) │
//! ├─────────────────────────────────────────┤
//! │  Database (rusqlite WAL + mmap)          │
//! │  Migrations (versioned, transactional)   │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Quick start
//!
//! ```ignore
//! use ci_store::{Database, RepoStore, BuildStore, JobStore};
//!
//! let db = Database::open_and_migrate("data/ci.db").await?;
//! let repos = RepoStore::new(db.clone());
//! let builds = BuildStore::new(db.clone());
//! let jobs = JobStore::new(db);
//! ```

pub mod build_store;
pub mod db;
pub mod error;
pub mod job_store;
pub mod migration;
pub mod repo_store;

pub use build_store::BuildStore;
pub use db::Database;
pub use error::{StoreError, StoreResult};
pub use job_store::JobStore;
pub use repo_store::RepoStore;
