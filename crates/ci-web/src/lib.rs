//! HTTP/REST front-end for the CI control plane.
//!
//! This crate is the thin outer surface sitting alongside the websocket
//! fan-out and authentication: it wires the app façade -- worker map,
//! coordination client, scheduler, repositories, error channel -- to an
//! Axum router and serves it until shutdown or a fatal error arrives on
//! that channel.
//!
//! - [`api`] -- REST handlers for trigger/stop/restart/list/get.
//! - [`ws`] -- websocket upgrade streaming [`ci_kernel::BroadcastSink`] events.
//! - [`auth`] -- single shared-secret bearer-token guard.
//! - [`state`] -- [`state::AppState`], the façade's shared state.
//! - [`server`] -- router assembly and the `Server::start` entry point.

pub mod api;
pub mod auth;
pub mod server;
pub mod state;
pub mod ws;

pub use server::Server;
pub use state::{AppState, WebConfig};
