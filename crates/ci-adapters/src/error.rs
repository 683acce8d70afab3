//! Adapter error types.
//!
//! All adapter subsystems surface errors through [`AdapterError`]. Each
//! variant carries enough context for callers to decide how to handle the
//! failure without inspecting opaque strings.

use ci_kernel::CiError;

/// Unified error type for CI adapters (SCM integrations, config parsing).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// An HTTP request to the SCM provider failed outright.
    #[error("scm request failed: {reason}")]
    Request { reason: String },

    /// The SCM provider responded with a non-2xx status.
    #[error("scm provider returned {status}: {message}")]
    ProviderStatus { status: u16, message: String },

    /// The requested config file does not exist at the given commit.
    #[error("config missing at commit {commit_sha}")]
    ConfigMissing { commit_sha: String },

    /// The config file could not be parsed into a job matrix.
    #[error("config invalid at {line}:{column}: {reason}")]
    ConfigInvalid {
        line: usize,
        column: usize,
        reason: String,
    },

    /// An operation exceeded its time limit.
    #[error("timeout after {seconds}s: {reason}")]
    Timeout { seconds: u64, reason: String },
}

/// Convenience alias used throughout the adapters crate.
pub type Result<T> = std::result::Result<T, AdapterError>;

impl From<AdapterError> for CiError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::ConfigMissing { commit_sha } => CiError::ConfigMissing { commit_sha },
            AdapterError::ConfigInvalid { line, column, reason } => {
                CiError::ConfigInvalid { line, column, reason }
            }
            other => CiError::ScmUnavailable {
                reason: other.to_string(),
            },
        }
    }
}
