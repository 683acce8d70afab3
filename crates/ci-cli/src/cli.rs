//! CLI argument definitions for the CI control plane.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use clap::{Parser, Subcommand};

/// abstruse-ci -- a distributed CI scheduler and worker-fleet coordinator.
#[derive(Parser)]
#[command(
    name = "abstruse-ci",
    version,
    about = "Distributed CI scheduler and worker-fleet coordinator",
    long_about = "Accepts build triggers, decomposes them into jobs, and schedules jobs \
                  across a dynamic fleet of workers that register, heartbeat, and \
                  disconnect through a shared coordination store."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the scheduler, worker registry, and HTTP/websocket front end.
    Serve {
        /// Address to bind the HTTP server to.
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// Port to listen on.
        #[arg(long, short, default_value_t = 8080)]
        port: u16,

        /// Path to the SQLite database file.
        #[arg(long, default_value = "data/ci.db")]
        db: String,

        /// Shared-secret bearer token required on `/api/*` requests. Empty
        /// disables the auth guard.
        #[arg(long, env = "CI_AUTH_TOKEN", default_value = "")]
        auth_token: String,
    },

    /// Trigger a build for a repository against a running server.
    Trigger {
        /// Base URL of a running server, e.g. `http://127.0.0.1:8080`.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Repository id to trigger.
        repo_id: u64,

        /// Id of the user triggering the build; must own the repository.
        #[arg(long)]
        user_id: uuid::Uuid,

        /// Branch to build.
        #[arg(long, default_value = "main")]
        branch: String,

        /// Commit SHA to build.
        #[arg(long)]
        commit_sha: String,

        /// Commit message.
        #[arg(long, default_value = "")]
        message: String,

        /// Bearer token, if the server requires one.
        #[arg(long, env = "CI_AUTH_TOKEN")]
        auth_token: Option<String>,
    },

    /// Print the status of a build from a running server.
    Status {
        /// Base URL of a running server, e.g. `http://127.0.0.1:8080`.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        server: String,

        /// Build id to look up.
        build_id: u64,

        /// Bearer token, if the server requires one.
        #[arg(long, env = "CI_AUTH_TOKEN")]
        auth_token: Option<String>,
    },
}
