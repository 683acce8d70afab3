//! Shared application state: the app façade's shared handle.
//!
//! Owns the one piece every route handler needs -- the build orchestrator,
//! which itself owns the scheduler, worker registry, and repositories
//! behind narrow traits -- plus the config carrying the bearer token
//! [`crate::auth`] checks. Wrapped in an `Arc` so Axum can share one
//! instance across every connection without cloning the orchestrator.

use std::sync::Arc;

use ci_kernel::orchestrator::BuildOrchestrator;

/// Bind address, port, and the shared-secret bearer token.
#[derive(Debug, Clone)]
pub struct WebConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Shared-secret token required on the `Authorization: Bearer <token>`
    /// header of every `/api/*` request. This is the full extent of
    /// "authentication" -- no user/account administration.
    pub auth_token: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 8080,
            auth_token: String::new(),
        }
    }
}

/// Shared state accessible from every Axum handler.
pub struct AppState {
    pub orchestrator: Arc<BuildOrchestrator>,
    pub config: WebConfig,
}

impl AppState {
    pub fn new(orchestrator: Arc<BuildOrchestrator>, config: WebConfig) -> Arc<Self> {
        Arc::new(Self { orchestrator, config })
    }
}
