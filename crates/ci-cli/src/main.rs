//! CLI entry point for the CI control plane.
//!
//! Provides the `abstruse-ci` command with subcommands for running the
//! scheduler/worker-registry/HTTP server (`serve`), triggering a build on a
//! running server (`trigger`), and checking a build's status (`status`).

mod cli;
mod helpers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use ci_adapters::{GitHubScm, YamlConfigExpander};
use ci_kernel::orchestrator::BuildOrchestrator;
use ci_kernel::{BroadcastSink, CommitAuthor, InMemoryCoordinationClient, Scheduler, WorkerRegistry};
use ci_store::{BuildStore, Database, JobStore, RepoStore};
use ci_web::{Server, WebConfig};
use clap::Parser;
use tracing::info;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { bind, port, db, auth_token } => cmd_serve(bind, port, db, auth_token).await,
        Commands::Trigger { server, repo_id, user_id, branch, commit_sha, message, auth_token } => {
            cmd_trigger(server, repo_id, user_id, branch, commit_sha, message, auth_token).await
        }
        Commands::Status { server, build_id, auth_token } => {
            cmd_status(server, build_id, auth_token).await
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: serve
// ---------------------------------------------------------------------------

/// How long `run_worker_watch` waits between reconnection attempts to the
/// coordination store's watch stream before giving up.
const WATCH_RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
/// Reconnection attempts before a lost watch is treated as fatal.
const WATCH_MAX_ATTEMPTS: u32 = 10;

async fn cmd_serve(bind: String, port: u16, db_path: String, auth_token: String) -> Result<()> {
    helpers::init_tracing("info");

    if let Some(parent) = std::path::Path::new(&db_path).parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("failed to create database directory")?;
    }

    let db = Database::open_and_migrate(db_path.clone())
        .await
        .context("failed to open database")?;
    info!(path = %db_path, "store initialized");

    let repos = Arc::new(RepoStore::new(db.clone()));
    let builds = Arc::new(BuildStore::new(db.clone()));
    let jobs = Arc::new(JobStore::new(db));

    let registry = WorkerRegistry::new();
    let coordination = InMemoryCoordinationClient::new();

    let watch_registry = registry.clone();
    let watch_client = Arc::clone(&coordination);
    tokio::spawn(async move {
        let err = ci_kernel::run_worker_watch(
            watch_client,
            watch_registry,
            WATCH_RECONNECT_BACKOFF,
            WATCH_MAX_ATTEMPTS,
        )
        .await;
        tracing::error!(error = %err, "worker watch terminated");
    });

    let scheduler = Scheduler::new(registry, coordination);
    let scheduler_handle = scheduler.start();

    let orchestrator = Arc::new(BuildOrchestrator::new(
        repos,
        builds,
        jobs,
        Arc::new(GitHubScm::new()),
        Arc::new(YamlConfigExpander::new()),
        scheduler,
        BroadcastSink::new(256),
    ));
    let orchestrator_handle = orchestrator.start();

    let config = WebConfig { bind_addr: bind, port, auth_token };
    let server = Server::new(config, orchestrator);
    info!(addr = %server.addr(), "serving");

    server.start().await.map_err(|e| anyhow::anyhow!("{e}"))?;

    scheduler_handle.abort();
    orchestrator_handle.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: trigger
// ---------------------------------------------------------------------------

async fn cmd_trigger(
    server: String,
    repo_id: u64,
    user_id: uuid::Uuid,
    branch: String,
    commit_sha: String,
    message: String,
    auth_token: Option<String>,
) -> Result<()> {
    helpers::init_tracing("warn");

    let body = serde_json::json!({
        "user_id": user_id,
        "branch": branch,
        "commit_sha": commit_sha,
        "commit_message": message,
        "author": CommitAuthor { name: "cli".into(), email: "cli@localhost".into() },
        "committer": CommitAuthor { name: "cli".into(), email: "cli@localhost".into() },
    });

    let client = reqwest::Client::new();
    let mut request = client.post(format!("{server}/api/repos/{repo_id}/trigger")).json(&body);
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.context("failed to reach server")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    if !status.is_success() {
        eprintln!("  Error: trigger failed ({status}): {body}");
        std::process::exit(1);
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: status
// ---------------------------------------------------------------------------

async fn cmd_status(server: String, build_id: u64, auth_token: Option<String>) -> Result<()> {
    helpers::init_tracing("warn");

    let client = reqwest::Client::new();
    let mut request = client.get(format!("{server}/api/builds/{build_id}"));
    if let Some(token) = auth_token {
        request = request.bearer_auth(token);
    }

    let response = request.send().await.context("failed to reach server")?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or_default();

    if !status.is_success() {
        eprintln!("  Error: status lookup failed ({status}): {body}");
        std::process::exit(1);
    }

    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}
