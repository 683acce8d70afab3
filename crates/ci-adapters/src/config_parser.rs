//! Repository CI config parser.
//!
//! Expands a `.abstruse.yml` document into the job matrix the orchestrator
//! schedules. The format is intentionally small: a default image/env/
//! priority at the top level, and a list of jobs that may each override
//! any of those defaults.
//!
//! ```yaml
//! image: rust:1.75
//! env:
//!   - RUST_BACKTRACE=1
//! jobs:
//!   - name: test
//!     commands:
//!       - cargo test
//!   - name: lint
//!     image: rust:nightly
//!     priority: 500
//!     commands:
//!       - cargo clippy -- -D warnings
//! ```

use ci_kernel::orchestrator::{ConfigExpander, JobSpec};
use serde::Deserialize;

use crate::error::AdapterError;

/// Priority assigned to a job that does not set one explicitly.
const DEFAULT_PRIORITY: i64 = 1000;

#[derive(Debug, Deserialize)]
struct RawConfig {
    image: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    #[serde(default)]
    priority: Option<i64>,
    jobs: Vec<RawJob>,
}

#[derive(Debug, Deserialize)]
struct RawJob {
    #[serde(default)]
    name: Option<String>,
    image: Option<String>,
    #[serde(default)]
    env: Vec<String>,
    priority: Option<i64>,
    commands: Vec<String>,
}

/// Parses `.abstruse.yml` documents into [`JobSpec`] matrices.
pub struct YamlConfigExpander;

impl YamlConfigExpander {
    pub fn new() -> Self {
        Self
    }
}

impl Default for YamlConfigExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigExpander for YamlConfigExpander {
    fn expand(&self, config: &str, commit_sha: &str) -> ci_kernel::Result<Vec<JobSpec>> {
        let raw: RawConfig = serde_yaml::from_str(config).map_err(|e| {
            let location = e.location();
            ci_kernel::CiError::from(AdapterError::ConfigInvalid {
                line: location.as_ref().map(|l| l.line()).unwrap_or(0),
                column: location.as_ref().map(|l| l.column()).unwrap_or(0),
                reason: e.to_string(),
            })
        })?;

        if raw.jobs.is_empty() {
            return Err(ci_kernel::CiError::from(AdapterError::ConfigInvalid {
                line: 0,
                column: 0,
                reason: format!("config at {commit_sha} declares no jobs"),
            }));
        }

        let default_image = raw.image.unwrap_or_else(|| "alpine:latest".to_string());
        let default_priority = raw.priority.unwrap_or(DEFAULT_PRIORITY);

        raw.jobs
            .into_iter()
            .map(|job| {
                let mut env = parse_env(&raw.env);
                env.extend(parse_env(&job.env));
                Ok(JobSpec {
                    commands: job.commands,
                    image: job.image.unwrap_or_else(|| default_image.clone()),
                    env,
                    priority: job.priority.unwrap_or(default_priority),
                })
            })
            .collect()
    }
}

fn parse_env(entries: &[String]) -> Vec<(String, String)> {
    entries
        .iter()
        .filter_map(|entry| entry.split_once('=').map(|(k, v)| (k.to_string(), v.to_string())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_jobs_with_inherited_defaults() {
        let config = r#"
image: rust:1.75
env:
  - RUST_BACKTRACE=1
jobs:
  - name: test
    commands:
      - cargo test
  - name: lint
    image: rust:nightly
    priority: 500
    commands:
      - cargo clippy
"#;
        let specs = YamlConfigExpander::new().expand(config, "deadbeef").unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].image, "rust:1.75");
        assert_eq!(specs[0].priority, 1000);
        assert_eq!(specs[0].env, vec![("RUST_BACKTRACE".to_string(), "1".to_string())]);
        assert_eq!(specs[1].image, "rust:nightly");
        assert_eq!(specs[1].priority, 500);
    }

    #[test]
    fn empty_job_list_is_rejected() {
        let config = "jobs: []";
        let err = YamlConfigExpander::new().expand(config, "deadbeef").unwrap_err();
        assert!(matches!(err, ci_kernel::CiError::ConfigInvalid { .. }));
    }

    #[test]
    fn malformed_yaml_reports_location() {
        let config = "jobs: [this is not valid: yaml: at all";
        let err = YamlConfigExpander::new().expand(config, "deadbeef").unwrap_err();
        assert!(matches!(err, ci_kernel::CiError::ConfigInvalid { .. }));
    }
}
