//! REST API route handlers.
//!
//! Thin translation layer over [`ci_kernel::orchestrator::BuildOrchestrator`]:
//! every handler here does request parsing and status-code mapping only.
//! No business logic lives in this module.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ci_kernel::orchestrator::TriggerRequest;
use ci_kernel::{Build, BuildId, CiError, CommitAuthor, JobId, RepoId, UserId};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

/// Wraps [`CiError`] so it can be returned directly from a handler.
pub struct ApiError(CiError);

impl From<CiError> for ApiError {
    fn from(err: CiError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CiError::WorkerNotFound { .. }
            | CiError::JobNotFound { .. }
            | CiError::BuildNotFound { .. }
            | CiError::NotFound { .. }
            | CiError::ConfigMissing { .. } => StatusCode::NOT_FOUND,
            CiError::InvalidJobState { .. } => StatusCode::CONFLICT,
            CiError::ConfigInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            CiError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CiError::WorkerUnreachable { .. }
            | CiError::ScmUnavailable { .. }
            | CiError::CoordinationUnavailable { .. } => StatusCode::BAD_GATEWAY,
            CiError::Persistence(_) | CiError::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(ErrorBody { error: self.0.to_string() })).into_response()
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

// ---------------------------------------------------------------------------
// POST /api/repos/:id/trigger
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub struct TriggerBuildBody {
    pub user_id: UserId,
    pub branch: String,
    pub commit_sha: String,
    #[serde(default)]
    pub commit_message: String,
    pub author: CommitAuthor,
    pub committer: CommitAuthor,
}

pub async fn trigger_build(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<RepoId>,
    Json(body): Json<TriggerBuildBody>,
) -> Result<Json<Build>, ApiError> {
    let build = state
        .orchestrator
        .trigger_build(TriggerRequest {
            repo_id,
            user_id: body.user_id,
            branch: body.branch,
            commit_sha: body.commit_sha,
            commit_message: body.commit_message,
            author: body.author,
            committer: body.committer,
        })
        .await?;
    Ok(Json(build))
}

// ---------------------------------------------------------------------------
// POST /api/builds/:id/stop
// ---------------------------------------------------------------------------

pub async fn stop_build(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<BuildId>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.stop_build(build_id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// POST /api/builds/:id/restart
// ---------------------------------------------------------------------------

pub async fn restart_build(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<BuildId>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.restart_build(build_id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// POST /api/jobs/:id/restart
// ---------------------------------------------------------------------------

/// The orchestrator's `restart_job` is keyed by `(build_id, job_id)`, but the
/// REST path only names the job -- the caller supplies the owning build as a
/// query parameter rather than this crate maintaining its own job->build
/// index.
#[derive(Deserialize)]
pub struct RestartJobParams {
    pub build_id: BuildId,
}

pub async fn restart_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<JobId>,
    Query(params): Query<RestartJobParams>,
) -> Result<StatusCode, ApiError> {
    state.orchestrator.restart_job(params.build_id, job_id).await?;
    Ok(StatusCode::ACCEPTED)
}

// ---------------------------------------------------------------------------
// GET /api/builds/:id
// ---------------------------------------------------------------------------

pub async fn get_build(
    State(state): State<Arc<AppState>>,
    Path(build_id): Path<BuildId>,
) -> Result<Json<Build>, ApiError> {
    let build = state.orchestrator.get_build(build_id).await?;
    Ok(Json(build))
}

// ---------------------------------------------------------------------------
// GET /api/repos/:id/builds
// ---------------------------------------------------------------------------

const DEFAULT_BUILD_LIST_LIMIT: u32 = 50;

#[derive(Deserialize)]
pub struct ListBuildsParams {
    pub limit: Option<u32>,
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Path(repo_id): Path<RepoId>,
    Query(params): Query<ListBuildsParams>,
) -> Result<Json<Vec<Build>>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_BUILD_LIST_LIMIT);
    let builds = state.orchestrator.list_builds(repo_id, limit).await?;
    Ok(Json(builds))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn not_found_variants_map_to_404() {
        let err = ApiError::from(CiError::BuildNotFound { build_id: 1 });
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn invalid_job_state_maps_to_conflict() {
        let err = ApiError::from(CiError::InvalidJobState { job_id: 1, reason: "x".into() });
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }

    #[test]
    fn timeout_maps_to_gateway_timeout() {
        let err = ApiError::from(CiError::Timeout { job_id: 1 });
        assert_eq!(err.into_response().status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn fatal_maps_to_internal_server_error() {
        let err = ApiError::from(CiError::Fatal("boom".into()));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
