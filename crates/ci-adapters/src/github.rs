//! GitHub REST API v3 SCM adapter.
//!
//! Resolves a repository's CI config file at a commit via the GitHub
//! contents API. Supports both github.com and GitHub Enterprise via a
//! configurable base URL, following the same request/response handling as
//! a general-purpose GitHub REST client: bearer auth, rate-limit logging,
//! and JSON-or-plain-message error bodies.

use async_trait::async_trait;
use base64::Engine;
use ci_kernel::{CiError, Repository};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};

/// Path, relative to the repository root, of the CI config file this
/// adapter looks for.
pub const CONFIG_PATH: &str = ".abstruse.yml";

/// GitHub REST API v3 SCM adapter.
pub struct GitHubScm {
    client: reqwest::Client,
}

impl GitHubScm {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("abstruse-ci/0.1")
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn contents_url(&self, repo: &Repository, path: &str, commit_sha: &str) -> String {
        format!(
            "{}/repos/{}/contents/{}?ref={}",
            repo.provider_url.trim_end_matches('/'),
            repo.full_name,
            path,
            commit_sha
        )
    }

    async fn send(&self, request: reqwest::RequestBuilder, commit_sha: &str) -> Result<Value> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                AdapterError::Timeout {
                    seconds: 30,
                    reason: format!("github contents request timed out: {e}"),
                }
            } else {
                AdapterError::Request {
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        if let Some(remaining) = response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            && remaining < 10
        {
            warn!(remaining, "github api rate limit is low");
        }

        let body_text = response.text().await.map_err(|e| AdapterError::Request {
            reason: format!("failed to read response body: {e}"),
        })?;

        if status.as_u16() == 404 {
            return Err(AdapterError::ConfigMissing {
                commit_sha: commit_sha.to_string(),
            });
        }
        if !status.is_success() {
            let error_body: Value =
                serde_json::from_str(&body_text).unwrap_or_else(|_| json!({ "message": body_text }));
            return Err(AdapterError::ProviderStatus {
                status: status.as_u16(),
                message: error_body
                    .get("message")
                    .and_then(|m| m.as_str())
                    .unwrap_or(&body_text)
                    .to_string(),
            });
        }

        serde_json::from_str(&body_text).map_err(|e| AdapterError::Request {
            reason: format!("failed to parse github response: {e}"),
        })
    }
}

impl Default for GitHubScm {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: String,
    encoding: String,
}

#[async_trait]
impl ci_kernel::ScmAdapter for GitHubScm {
    async fn fetch_config(&self, repo: &Repository, commit_sha: &str) -> ci_kernel::Result<String> {
        let url = self.contents_url(repo, CONFIG_PATH, commit_sha);
        debug!(url, "fetching ci config from github");

        let request = self
            .client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", repo.provider_token))
            .header("X-GitHub-Api-Version", "2022-11-28");

        let body = self
            .send(request, commit_sha)
            .await
            .map_err(CiError::from)?;

        let contents: ContentsResponse = serde_json::from_value(body).map_err(|e| {
            CiError::from(AdapterError::Request {
                reason: format!("unexpected contents response shape: {e}"),
            })
        })?;

        if contents.encoding != "base64" {
            return Err(CiError::from(AdapterError::Request {
                reason: format!("unsupported content encoding: {}", contents.encoding),
            }));
        }

        let cleaned: String = contents.content.chars().filter(|c| !c.is_whitespace()).collect();
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| {
                CiError::from(AdapterError::Request {
                    reason: format!("failed to decode base64 content: {e}"),
                })
            })?;

        String::from_utf8(decoded).map_err(|e| {
            CiError::from(AdapterError::Request {
                reason: format!("config file is not valid utf-8: {e}"),
            })
        })
    }
}
