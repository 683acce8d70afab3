//! Router assembly and the app façade's entry point.
//!
//! [`Server`] owns the shared [`AppState`], builds the Axum router (CORS,
//! the bearer-token guard on `/api/*`, and the websocket upgrade route),
//! and serves it until the listener is closed. Wiring the coordination
//! client, worker registry, and scheduler/orchestrator background tasks is
//! the caller's job (`ci-cli`'s `serve` subcommand) -- `Server` only takes
//! the already-assembled orchestrator and turns it into an HTTP front door.

use std::sync::Arc;

use axum::Router;
use axum::http::{HeaderValue, Method};
use axum::routing::{get, post};
use ci_kernel::orchestrator::BuildOrchestrator;
use tower_http::cors::CorsLayer;

use crate::api;
use crate::auth::require_bearer_token;
use crate::state::{AppState, WebConfig};
use crate::ws;

/// The CI control plane's HTTP/websocket front end.
pub struct Server {
    config: WebConfig,
    state: Arc<AppState>,
}

impl Server {
    pub fn new(config: WebConfig, orchestrator: Arc<BuildOrchestrator>) -> Self {
        let state = AppState::new(orchestrator, config.clone());
        Self { config, state }
    }

    /// The `host:port` string this server will bind to.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.config.bind_addr, self.config.port)
    }

    /// Router assembly, exposed to the binary crate and to tests that need
    /// to serve on an ephemeral port (`bind_addr:0`) rather than calling
    /// [`Server::start`], which blocks forever.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin("*".parse::<HeaderValue>().unwrap())
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(tower_http::cors::Any);

        let api_routes = Router::new()
            .route("/repos/{id}/trigger", post(api::trigger_build))
            .route("/builds/{id}/stop", post(api::stop_build))
            .route("/builds/{id}/restart", post(api::restart_build))
            .route("/jobs/{id}/restart", post(api::restart_job))
            .route("/builds/{id}", get(api::get_build))
            .route("/repos/{id}/builds", get(api::list_builds))
            .layer(axum::middleware::from_fn_with_state(
                Arc::clone(&self.state),
                require_bearer_token,
            ));

        Router::new()
            .nest("/api", api_routes)
            .route("/ws", get(ws::ws_handler))
            .layer(cors)
            .with_state(Arc::clone(&self.state))
    }

    /// Bind the configured address. Split out from [`Server::start`] so
    /// callers (and tests) that need the actual bound port -- e.g. when
    /// configured with port `0` -- can read it before serving begins.
    pub async fn bind(&self) -> std::io::Result<tokio::net::TcpListener> {
        tokio::net::TcpListener::bind(self.addr()).await
    }

    /// Serve on an already-bound listener until it closes or a fatal error
    /// is returned.
    pub async fn serve(
        self,
        listener: tokio::net::TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let router = self.router();
        axum::serve(listener, router).await?;
        Ok(())
    }

    /// Bind the configured address and serve until the listener closes or a
    /// fatal error is returned.
    pub async fn start(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = self.addr();
        tracing::info!(addr = %addr, "starting web server");
        let listener = self.bind().await?;
        self.serve(listener).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_combines_bind_addr_and_port() {
        let server = Server::new(
            WebConfig { bind_addr: "0.0.0.0".into(), port: 9090, auth_token: String::new() },
            crate::test_support::test_orchestrator(),
        );
        assert_eq!(server.addr(), "0.0.0.0:9090");
    }

    #[test]
    fn router_builds_without_panicking() {
        let server = Server::new(WebConfig::default(), crate::test_support::test_orchestrator());
        let _ = server.router();
    }
}
